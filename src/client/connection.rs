use std::future::Future;
use std::pin::Pin;

use crate::Error;

/// The writing half of a websocket connection.
///
/// Built in implementations are provided for `tungstenite` sinks.
///
/// If users wish to add support for a new client they should implement this,
/// [ConnectionReceiver] & [Connector].
pub trait ConnectionSender {
    /// Send a message on this connection
    fn send(&mut self, message: Message) -> impl Future<Output = Result<(), Error>> + Send;
}

/// The reading half of a websocket connection.
pub trait ConnectionReceiver {
    /// Receive the next message on this connection.
    ///
    /// Implementations should deliver whole messages, reassembling any
    /// fragmented frames.  `None` means the connection has ended.
    fn receive(&mut self) -> impl Future<Output = Option<Message>> + Send;
}

/// Opens websocket connections.
///
/// The client calls this every time it needs a new socket, so
/// implementations should not cache connections.
pub trait Connector {
    /// The writing half of the connections this connector opens
    type Sender: ConnectionSender + Send + 'static;

    /// The reading half of the connections this connector opens
    type Receiver: ConnectionReceiver + Send + 'static;

    /// Open a connection as described by `request`.
    fn connect(
        &self,
        request: ConnectionRequest,
    ) -> impl Future<Output = Result<Socket<Self::Sender, Self::Receiver>, Error>> + Send;
}

/// Everything a [Connector] needs to know to open a socket.
#[derive(Clone, Debug, Default)]
pub struct ConnectionRequest {
    /// The endpoint to connect to
    pub url: String,
    /// The websocket subprotocols to offer, in order of preference
    pub subprotocols: Vec<String>,
    /// Any extra headers to send with the upgrade request
    pub headers: Vec<(String, String)>,
}

/// An open websocket connection, split into its two halves.
pub struct Socket<Sender, Receiver> {
    /// The writing half
    pub sender: Sender,
    /// The reading half
    pub receiver: Receiver,
    /// The subprotocol the server accepted, if it told us
    pub protocol: Option<String>,
}

/// A websocket message
///
/// Websocket client libraries usually provide their own version of this struct.
/// The [ConnectionSender] & [ConnectionReceiver] for a given client should handle
/// translation to & from this enum.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// A message containing the given text payload
    Text(String),
    /// A binary message.  Neither protocol uses these.
    Binary(Vec<u8>),
    /// A message that closes the connection with the given code & reason
    Close {
        /// The status code for this close message
        code: Option<u16>,
        /// Some text explaining the reason the connection is being closed
        reason: Option<String>,
    },
    /// A ping
    Ping,
    /// A reply to a ping
    Pong,
}

impl Message {
    pub(crate) fn normal_closure() -> Self {
        Message::Close {
            code: Some(1000),
            reason: Some("Normal Closure".into()),
        }
    }
}

/// An object safe wrapper around the ConnectionSender trait, allowing us
/// to use it dynamically
pub(crate) trait ObjectSafeSender: Send {
    fn send(
        &mut self,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>>;
}

impl<T: ConnectionSender + Send> ObjectSafeSender for T {
    fn send(
        &mut self,
        message: Message,
    ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + '_>> {
        Box::pin(ConnectionSender::send(self, message))
    }
}

/// An object safe wrapper around the ConnectionReceiver trait
pub(crate) trait ObjectSafeReceiver: Send {
    fn receive(&mut self) -> Pin<Box<dyn Future<Output = Option<Message>> + Send + '_>>;
}

impl<T: ConnectionReceiver + Send> ObjectSafeReceiver for T {
    fn receive(&mut self) -> Pin<Box<dyn Future<Output = Option<Message>> + Send + '_>> {
        Box::pin(ConnectionReceiver::receive(self))
    }
}

pub(crate) struct BoxedSocket {
    pub(crate) sender: Box<dyn ObjectSafeSender>,
    pub(crate) receiver: Box<dyn ObjectSafeReceiver>,
    pub(crate) protocol: Option<String>,
}

/// An object safe wrapper around the Connector trait
pub(crate) trait ObjectSafeConnector: Send + Sync {
    fn connect(
        &self,
        request: ConnectionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedSocket, Error>> + Send + '_>>;
}

impl<T: Connector + Send + Sync> ObjectSafeConnector for T {
    fn connect(
        &self,
        request: ConnectionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<BoxedSocket, Error>> + Send + '_>> {
        Box::pin(async move {
            let Socket {
                sender,
                receiver,
                protocol,
            } = Connector::connect(self, request).await?;

            Ok(BoxedSocket {
                sender: Box::new(sender),
                receiver: Box::new(receiver),
                protocol,
            })
        })
    }
}
