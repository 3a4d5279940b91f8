#[cfg(feature = "logging")]
macro_rules! trace {
    ($($arg:tt)+) => (
        log::trace!(target: "graphql-ws-transport", $($arg)+)
    )
}

#[cfg(not(feature = "logging"))]
macro_rules! trace {
    ($($t:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! debug {
    ($($arg:tt)+) => (
        log::debug!(target: "graphql-ws-transport", $($arg)+)
    )
}

#[cfg(not(feature = "logging"))]
macro_rules! debug {
    ($($t:tt)*) => {};
}

#[cfg(feature = "logging")]
macro_rules! warning {
    ($($arg:tt)+) => (
        log::warn!(target: "graphql-ws-transport", $($arg)+)
    )
}

#[cfg(not(feature = "logging"))]
macro_rules! warning {
    ($($t:tt)*) => {};
}

pub(crate) use debug;
pub(crate) use trace;
pub(crate) use warning;
