use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{
    codec::Envelope,
    logging::{debug, warning},
    protocol::{Event, Protocol},
    Error,
};

use super::broadcast::Broadcaster;

/// The state of the connection to the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// There's no socket.  The next operation will open one.
    Disconnected,
    /// A socket is being opened, or the handshake is in progress.
    Connecting,
    /// The handshake has completed and operations can run.
    Connected,
}

/// A message read from the socket, as published to operations.
#[derive(Clone, Debug)]
pub(crate) struct Inbound {
    pub(crate) envelope: Envelope,
    pub(crate) event: Event,
    /// Whether this message ends its operation
    pub(crate) terminal: bool,
}

struct ManagerState {
    state: ConnectionState,
    /// The attempt number fed to the backoff function, reset to 1 on success.
    reconnect_attempt: u32,
    /// Bumped every time a connection is established.
    generation: u64,
    /// How many connection attempts have finished, successfully or not.
    attempts_finished: u64,
    last_outcome: Option<Result<(), Error>>,
    protocol: Option<Protocol>,
}

/// Owns the connection state machine.
///
/// All transitions happen on the send queue's worker (connects) and the
/// receive loop runner (disconnects).  Everyone else observes: via
/// [`ConnectionManager::state`], the state stream, the error stream or the
/// inbound message stream.
pub(crate) struct ConnectionManager {
    state: Mutex<ManagerState>,
    incoming: Broadcaster<Inbound>,
    states: Broadcaster<ConnectionState>,
    errors: Broadcaster<Error>,
    shutdown: async_channel::Sender<()>,
    shutdown_requested: async_channel::Receiver<()>,
    finished: async_channel::Receiver<()>,
}

impl ConnectionManager {
    /// Creates a manager, along with the sender the actor drops once it's
    /// completely finished.
    pub(crate) fn new(subscription_buffer_size: usize) -> (Self, async_channel::Sender<()>) {
        let (shutdown, shutdown_requested) = async_channel::bounded(1);
        let (finished_sender, finished) = async_channel::bounded(1);

        let manager = ConnectionManager {
            state: Mutex::new(ManagerState {
                state: ConnectionState::Disconnected,
                reconnect_attempt: 1,
                generation: 0,
                attempts_finished: 0,
                last_outcome: None,
                protocol: None,
            }),
            incoming: Broadcaster::bounded(subscription_buffer_size),
            states: Broadcaster::unbounded(),
            errors: Broadcaster::unbounded(),
            shutdown,
            shutdown_requested,
            finished,
        };

        (manager, finished_sender)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub(crate) fn protocol(&self) -> Option<Protocol> {
        self.lock().protocol
    }

    /// The generation of the current connection, if there is one.
    pub(crate) fn current_generation(&self) -> Option<u64> {
        let state = self.lock();
        (state.state == ConnectionState::Connected).then_some(state.generation)
    }

    pub(crate) fn incoming(&self) -> &Broadcaster<Inbound> {
        &self.incoming
    }

    pub(crate) fn states(&self) -> &Broadcaster<ConnectionState> {
        &self.states
    }

    pub(crate) fn errors(&self) -> &Broadcaster<Error> {
        &self.errors
    }

    pub(crate) fn attempts_finished(&self) -> u64 {
        self.lock().attempts_finished
    }

    /// The outcome of the latest connection attempt, if one has finished since
    /// `observed` attempts had.
    pub(crate) fn outcome_since(&self, observed: u64) -> Option<Result<(), Error>> {
        let state = self.lock();
        if state.attempts_finished > observed {
            state.last_outcome.clone()
        } else {
            None
        }
    }

    /// `Disconnected -> Connecting`.  Returns the attempt number to back off by.
    pub(crate) fn begin_connecting(&self) -> u32 {
        let attempt = {
            let mut state = self.lock();
            state.state = ConnectionState::Connecting;
            state.reconnect_attempt
        };
        debug!("connecting, attempt {attempt}");
        self.states.try_publish(ConnectionState::Connecting);
        attempt
    }

    /// `Connecting -> Connected`.  Returns the generation of the new connection.
    pub(crate) fn connected(&self, protocol: Protocol) -> u64 {
        let generation = {
            let mut state = self.lock();
            state.state = ConnectionState::Connected;
            state.reconnect_attempt = 1;
            state.generation += 1;
            state.attempts_finished += 1;
            state.last_outcome = Some(Ok(()));
            state.protocol = Some(protocol);
            state.generation
        };
        debug!("connected using {}", protocol.subprotocol());
        self.states.try_publish(ConnectionState::Connected);
        generation
    }

    /// `Connecting -> Disconnected`.
    pub(crate) fn connect_failed(&self, error: Error) {
        {
            let mut state = self.lock();
            state.state = ConnectionState::Disconnected;
            state.reconnect_attempt = state.reconnect_attempt.saturating_add(1);
            state.attempts_finished += 1;
            state.last_outcome = Some(Err(error.clone()));
        }
        warning!("connection attempt failed: {error}");
        self.states.try_publish(ConnectionState::Disconnected);
        self.errors.try_publish(error);
    }

    /// `Connected -> Disconnected`, if `generation` is still the current connection.
    ///
    /// Returns true if this call performed the transition.
    pub(crate) fn connection_lost(&self, generation: u64, error: Error) -> bool {
        {
            let mut state = self.lock();
            if state.state != ConnectionState::Connected || state.generation != generation {
                return false;
            }
            state.state = ConnectionState::Disconnected;
            state.reconnect_attempt = state.reconnect_attempt.saturating_add(1);
        }
        warning!("connection lost: {error}");
        self.states.try_publish(ConnectionState::Disconnected);
        self.errors.try_publish(error);
        true
    }

    /// Starts shutting down.  Returns false if shutdown had already been requested.
    pub(crate) fn request_shutdown(&self) -> bool {
        self.shutdown.close()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.is_closed()
    }

    /// Resolves once shutdown has been requested.
    pub(crate) async fn shutdown_requested(&self) {
        // Nothing is ever sent, this only returns once the channel is closed.
        self.shutdown_requested.recv().await.ok();
    }

    /// Called by the actor as the very last thing it does.
    pub(crate) fn shut_down(&self) {
        let was_connected = {
            let mut state = self.lock();
            let was_connected = state.state != ConnectionState::Disconnected;
            state.state = ConnectionState::Disconnected;
            state.last_outcome = Some(Err(Error::Closed));
            was_connected
        };
        if was_connected {
            self.states.try_publish(ConnectionState::Disconnected);
        }
        self.incoming.close();
        self.states.close();
        self.errors.close();
    }

    /// Resolves once the actor has finished, or been dropped.
    pub(crate) async fn finished(&self) {
        self.finished.recv().await.ok();
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
