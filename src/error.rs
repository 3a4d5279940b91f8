#[derive(thiserror::Error, Debug, Clone)]
/// Error type
pub enum Error {
    /// Unknown error
    #[error("unknown: {0}")]
    Unknown(String),
    /// The underlying socket could not be opened
    #[error("couldn't open connection, reason: {0}")]
    Connect(String),
    /// Unexpected close frame
    #[error("got close frame. code: {0}, reason: {1}")]
    Close(u16, String),
    /// The socket ended without a close frame
    #[error("connection dropped")]
    ConnectionDropped,
    /// The server sent a frame we can't interpret, e.g. a binary frame
    #[error("unsupported frame received: {0}")]
    UnsupportedFrame(String),
    /// A handshake or keep alive deadline passed
    #[error("timed out: {0}")]
    Timeout(String),
    /// The server answered `connection_init` with `connection_error`
    #[error("connection rejected by server, payload: {0:?}")]
    ConnectionRejected(Option<serde_json::Value>),
    /// The server sent a message that doesn't make sense for the negotiated protocol
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Decoding / parsing error
    #[error("message decode error, reason: {0}")]
    Decode(String),
    /// Serializing error
    #[error("couldn't serialize message, reason: {0}")]
    Serializing(String),
    /// Sending error
    #[error("message sending error, reason: {0}")]
    Send(String),
    /// The negotiated protocol has no equivalent of the requested message
    #[error("{0} is not supported by this protocol")]
    Unsupported(&'static str),
    /// A message was only to be sent on an open connection and there wasn't one
    #[error("not connected")]
    NotConnected,
    /// The message was dropped from the send queue before it was written
    #[error("message cancelled before it was sent")]
    Cancelled,
    /// The client has been shut down
    #[error("client has been closed")]
    Closed,
}

impl Error {
    /// True for errors that end the physical connection: failures to open a socket,
    /// handshake rejections, closes, drops & keep alive timeouts.
    ///
    /// These are fanned out to every live operation, which may decide to retry.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Connect(_)
                | Error::Close(..)
                | Error::ConnectionDropped
                | Error::UnsupportedFrame(_)
                | Error::Timeout(_)
                | Error::ConnectionRejected(_)
                | Error::Send(_)
                | Error::Decode(_)
        )
    }

    /// True if this error is the result of the client shutting down rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Closed | Error::Cancelled)
    }
}
