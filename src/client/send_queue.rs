use std::{future::Future, sync::Arc, time::Duration};

use futures_lite::future;
use futures_timer::Delay;
use serde_json::Value;

use crate::{
    codec::Codec,
    logging::{debug, trace, warning},
    protocol::{self, Outgoing, Protocol, ProtocolHandler},
    Error,
};

use super::{
    backoff::BackoffFn,
    connection::{BoxedSocket, ConnectionRequest, Message, ObjectSafeConnector, ObjectSafeSender},
    manager::{ConnectionManager, ConnectionState},
    receive_loop::ReaderHandoff,
};

const FAREWELL_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) type InitPayloadFn = Arc<dyn Fn() -> Option<Value> + Send + Sync>;
pub(crate) type ConnectedHook = Arc<dyn Fn(Option<&Value>) + Send + Sync>;
pub(crate) type RequestConfigurator = Arc<dyn Fn(&mut ConnectionRequest) + Send + Sync>;

/// Whether a queued message may open a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Connect (and handshake) first if there's no connection
    Connect,
    /// Fail with `Error::NotConnected` if there's no connection
    IfConnected,
}

pub(crate) enum Command {
    Send {
        message: Outgoing,
        delivery: Delivery,
        done: async_channel::Sender<Result<(), Error>>,
    },
    Connect {
        /// How many connection attempts had finished when this was enqueued
        observed: u64,
        done: async_channel::Sender<Result<(), Error>>,
    },
    /// The receive loop for this connection has ended
    ConnectionLost { generation: u64 },
    /// Tear down this connection, e.g. because keep alives stopped arriving
    Reset { generation: u64, error: Error },
}

impl Command {
    fn cancel(self) {
        match self {
            Command::Send { done, .. } => {
                done.try_send(Err(Error::Cancelled)).ok();
            }
            Command::Connect { done, .. } => {
                done.try_send(Err(Error::Closed)).ok();
            }
            Command::ConnectionLost { .. } | Command::Reset { .. } => {}
        }
    }
}

/// Resolves once a queued command has been handled.
#[must_use]
pub(crate) struct Completion(async_channel::Receiver<Result<(), Error>>);

impl Completion {
    fn resolved(result: Result<(), Error>) -> Self {
        let (sender, receiver) = async_channel::bounded(1);
        sender.try_send(result).ok();
        Completion(receiver)
    }

    /// A completion that was dropped without being resolved counts as cancelled.
    pub(crate) async fn wait(self) -> Result<(), Error> {
        self.0.recv().await.unwrap_or(Err(Error::Cancelled))
    }
}

/// A handle for queueing work on the send worker.
#[derive(Clone)]
pub(crate) struct SendQueue {
    commands: async_channel::Sender<Command>,
    manager: Arc<ConnectionManager>,
}

impl SendQueue {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
    ) -> (SendQueue, async_channel::Receiver<Command>) {
        let (commands, receiver) = async_channel::unbounded();
        (SendQueue { commands, manager }, receiver)
    }

    /// Queues a message to be written, in order, by the worker.
    pub(crate) fn enqueue(&self, message: Outgoing, delivery: Delivery) -> Completion {
        let (done, receiver) = async_channel::bounded(1);
        let command = Command::Send {
            message,
            delivery,
            done,
        };
        match self.commands.try_send(command) {
            Ok(()) => Completion(receiver),
            Err(_) => Completion::resolved(Err(Error::Cancelled)),
        }
    }

    /// Suspends until the connection is up, sharing any in flight attempt.
    pub(crate) async fn ensure_connected(&self) -> Result<(), Error> {
        if self.manager.is_shutting_down() {
            return Err(Error::Closed);
        }
        if self.manager.state() == ConnectionState::Connected {
            return Ok(());
        }

        let (done, receiver) = async_channel::bounded(1);
        let command = Command::Connect {
            observed: self.manager.attempts_finished(),
            done,
        };
        if self.commands.try_send(command).is_err() {
            return Err(Error::Closed);
        }

        receiver.recv().await.unwrap_or(Err(Error::Closed))
    }

    pub(crate) fn connection_lost(&self, generation: u64) {
        self.commands
            .try_send(Command::ConnectionLost { generation })
            .ok();
    }

    pub(crate) fn reset(&self, generation: u64, error: Error) {
        self.commands
            .try_send(Command::Reset { generation, error })
            .ok();
    }
}

/// Everything the worker needs to open and set up a connection.
pub(crate) struct ConnectSettings {
    pub(crate) url: String,
    pub(crate) protocol: Option<Protocol>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) configure_request: Option<RequestConfigurator>,
    pub(crate) init_payload: Option<InitPayloadFn>,
    pub(crate) on_connected: Option<ConnectedHook>,
    pub(crate) backoff: BackoffFn,
    pub(crate) init_timeout: Duration,
}

impl ConnectSettings {
    fn request(&self) -> ConnectionRequest {
        let subprotocols = match self.protocol {
            Some(protocol) => vec![protocol.subprotocol().to_owned()],
            None => Protocol::ALL
                .iter()
                .map(|protocol| protocol.subprotocol().to_owned())
                .collect(),
        };

        let mut request = ConnectionRequest {
            url: self.url.clone(),
            subprotocols,
            headers: self.headers.clone(),
        };
        if let Some(configure) = &self.configure_request {
            configure(&mut request);
        }
        request
    }

    /// Picks the protocol for a socket, given the subprotocol the server accepted.
    fn select_protocol(&self, accepted: Option<&str>) -> Result<Protocol, Error> {
        let accepted = match accepted.map(str::trim) {
            None | Some("") => None,
            Some(name) => Some(Protocol::from_subprotocol(name).ok_or_else(|| {
                Error::ProtocolViolation(format!("server selected unknown subprotocol {name}"))
            })?),
        };

        match (self.protocol, accepted) {
            (Some(requested), Some(accepted)) if requested != accepted => {
                Err(Error::ProtocolViolation(format!(
                    "requested {} but server selected {}",
                    requested.subprotocol(),
                    accepted.subprotocol()
                )))
            }
            (Some(requested), _) => Ok(requested),
            (None, Some(accepted)) => Ok(accepted),
            (None, None) => Ok(Protocol::GraphqlTransportWs),
        }
    }
}

struct LiveConnection {
    sender: Box<dyn ObjectSafeSender>,
    handler: Arc<dyn ProtocolHandler>,
    generation: u64,
    abort: async_channel::Sender<()>,
}

struct Opened {
    socket: BoxedSocket,
    handler: Arc<dyn ProtocolHandler>,
    ack: Option<Value>,
}

/// Opens sockets and runs handshakes.  Shared by reference across awaits,
/// so everything in here is `Sync`.
struct Opener {
    manager: Arc<ConnectionManager>,
    connector: Box<dyn ObjectSafeConnector>,
    codec: Arc<dyn Codec>,
    settings: ConnectSettings,
}

/// The only writer to the socket.
///
/// Handles queued commands one at a time, so writes are never interleaved,
/// and opens connections (with backoff & handshake) whenever a command needs one.
pub(crate) struct SendWorker {
    commands: async_channel::Receiver<Command>,
    opener: Opener,
    readers: async_channel::Sender<ReaderHandoff>,
    live: Option<LiveConnection>,
}

impl SendWorker {
    pub(crate) fn new(
        commands: async_channel::Receiver<Command>,
        manager: Arc<ConnectionManager>,
        connector: Box<dyn ObjectSafeConnector>,
        codec: Arc<dyn Codec>,
        settings: ConnectSettings,
        readers: async_channel::Sender<ReaderHandoff>,
    ) -> Self {
        SendWorker {
            commands,
            opener: Opener {
                manager,
                connector,
                codec,
                settings,
            },
            readers,
            live: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let command = self
                .opener
                .until_shutdown(async { self.commands.recv().await.ok() })
                .await
                .flatten();
            let Some(command) = command else {
                break;
            };
            self.handle_command(command).await;
        }

        self.shut_down().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                message,
                delivery,
                done,
            } => {
                if delivery == Delivery::Connect {
                    if let Err(error) = self.connect().await {
                        done.try_send(Err(error)).ok();
                        return;
                    }
                }
                let result = self.write(message).await;
                done.try_send(result).ok();
            }
            Command::Connect { observed, done } => {
                let result = match self.opener.manager.outcome_since(observed) {
                    // Someone else's attempt failed while this caller was waiting.
                    Some(Err(error)) if self.live.is_none() => Err(error),
                    _ => self.connect().await,
                };
                done.try_send(result).ok();
            }
            Command::ConnectionLost { generation } => {
                if self.is_current(generation) {
                    trace!("dropping socket for connection {generation}");
                    self.live = None;
                }
            }
            Command::Reset { generation, error } => {
                if self.is_current(generation) {
                    self.drop_connection(error);
                }
            }
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
    }

    async fn connect(&mut self) -> Result<(), Error> {
        if let Some(live) = &self.live {
            if self.opener.manager.current_generation() == Some(live.generation) {
                return Ok(());
            }
        }
        if let Some(stale) = self.live.take() {
            trace!("connection {} already lost, replacing it", stale.generation);
            stale.abort.close();
        }
        if self.opener.manager.is_shutting_down() {
            return Err(Error::Closed);
        }

        let attempt = self.opener.manager.begin_connecting();
        let delay = (self.opener.settings.backoff)(attempt);
        if !delay.is_zero() {
            debug!("waiting {delay:?} before connection attempt {attempt}");
            self.opener
                .until_shutdown(Delay::new(delay))
                .await
                .ok_or(Error::Closed)?;
        }

        let opened = match self.opener.until_shutdown(self.opener.open()).await {
            None => return Err(Error::Closed),
            Some(Err(error)) => {
                self.opener.manager.connect_failed(error.clone());
                return Err(error);
            }
            Some(Ok(opened)) => opened,
        };

        let Opened {
            socket,
            handler,
            ack,
        } = opened;

        let generation = self.opener.manager.connected(handler.protocol());
        if let Some(hook) = &self.opener.settings.on_connected {
            hook(ack.as_ref());
        }

        let (abort, aborted) = async_channel::bounded(1);
        self.readers
            .try_send(ReaderHandoff {
                receiver: socket.receiver,
                handler: Arc::clone(&handler),
                generation,
                aborted,
            })
            .ok();

        self.live = Some(LiveConnection {
            sender: socket.sender,
            handler,
            generation,
            abort,
        });

        Ok(())
    }

    async fn write(&mut self, message: Outgoing) -> Result<(), Error> {
        let Some(live) = self.live.as_mut() else {
            return Err(Error::NotConnected);
        };

        let envelope = message.into_envelope(live.handler.as_ref())?;
        let text = self.opener.codec.encode(&envelope)?;
        trace!("sending {text}");

        if let Err(error) = live.sender.send(Message::Text(text)).await {
            self.drop_connection(error.clone());
            return Err(error);
        }
        Ok(())
    }

    /// Disposes of the current socket after a failure.
    fn drop_connection(&mut self, error: Error) {
        if let Some(live) = self.live.take() {
            self.opener.manager.connection_lost(live.generation, error);
            live.abort.close();
        }
    }

    async fn shut_down(&mut self) {
        debug!("shutting down connection");

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.cancel();
        }

        if let Some(mut live) = self.live.take() {
            let farewell = async {
                match self.opener.codec.encode(&live.handler.terminate_message()) {
                    Ok(text) => {
                        live.sender.send(Message::Text(text)).await.ok();
                    }
                    Err(error) => {
                        warning!("couldn't encode farewell message: {error}");
                    }
                }
                live.sender.send(Message::normal_closure()).await.ok();
            };
            future::or(farewell, Delay::new(FAREWELL_TIMEOUT)).await;
            live.abort.close();
        }

        self.readers.close();
        self.opener.manager.shut_down();
    }
}

impl Opener {
    /// Opens a socket and runs the handshake on it.
    async fn open(&self) -> Result<Opened, Error> {
        let mut socket = self.connector.connect(self.settings.request()).await?;
        let protocol = self.settings.select_protocol(socket.protocol.as_deref())?;
        let handler = protocol.handler();
        let payload = self.settings.init_payload.as_ref().and_then(|init| init());

        let handshake = protocol::handshake(
            handler.as_ref(),
            self.codec.as_ref(),
            socket.sender.as_mut(),
            socket.receiver.as_mut(),
            payload,
        );
        let timeout = async {
            Delay::new(self.settings.init_timeout).await;
            Err(Error::Timeout("no connection_ack received".into()))
        };
        let ack = future::or(handshake, timeout).await?;

        Ok(Opened {
            socket,
            handler,
            ack,
        })
    }

    async fn until_shutdown<T>(&self, future: impl Future<Output = T>) -> Option<T> {
        future::or(
            async {
                self.manager.shutdown_requested().await;
                None
            },
            async { Some(future.await) },
        )
        .await
    }
}
