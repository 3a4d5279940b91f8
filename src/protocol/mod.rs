//! The two GraphQL over websocket protocols.
//!
//! - [`GraphqlWs`] implements the legacy [subscriptions-transport-ws protocol][1],
//!   negotiated as `graphql-ws`.
//! - [`GraphqlTransportWs`] implements its successor, the [graphql-ws protocol][2],
//!   negotiated as `graphql-transport-ws`.
//!
//! Both share the same multiplexing skeleton and only differ in vocabulary and
//! keepalive behaviour, so the rest of the crate talks to them through the
//! [`ProtocolHandler`] trait.
//!
//! [1]: https://github.com/apollographql/subscriptions-transport-ws/blob/master/PROTOCOL.md
//! [2]: https://github.com/enisdenjo/graphql-ws/blob/HEAD/PROTOCOL.md

use std::sync::Arc;

use serde_json::Value;

use crate::{
    client::{Message, ObjectSafeReceiver, ObjectSafeSender},
    codec::{Codec, Envelope},
    logging::trace,
    Error,
};

mod graphql_transport_ws;
mod graphql_ws;

pub use self::{graphql_transport_ws::GraphqlTransportWs, graphql_ws::GraphqlWs};

/// The protocols supported by this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// The legacy subscriptions-transport-ws protocol.
    GraphqlWs,
    /// The graphql-ws protocol.
    GraphqlTransportWs,
}

impl Protocol {
    /// Every supported protocol, in order of preference.
    pub const ALL: [Protocol; 2] = [Protocol::GraphqlTransportWs, Protocol::GraphqlWs];

    /// The identifier used for this protocol in the `Sec-WebSocket-Protocol` header.
    pub fn subprotocol(self) -> &'static str {
        match self {
            Protocol::GraphqlWs => "graphql-ws",
            Protocol::GraphqlTransportWs => "graphql-transport-ws",
        }
    }

    /// Looks up a protocol by its `Sec-WebSocket-Protocol` identifier.
    pub fn from_subprotocol(name: &str) -> Option<Self> {
        Protocol::ALL
            .into_iter()
            .find(|protocol| protocol.subprotocol() == name.trim())
    }

    pub(crate) fn handler(self) -> Arc<dyn ProtocolHandler> {
        match self {
            Protocol::GraphqlWs => Arc::new(GraphqlWs),
            Protocol::GraphqlTransportWs => Arc::new(GraphqlTransportWs),
        }
    }
}

/// What an incoming message means, independent of protocol vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// The server accepted `connection_init`
    ConnectionAck,
    /// The server rejected `connection_init`, or reported a connection level error
    ConnectionError,
    /// Legacy `ka`, purely informational
    KeepAlive,
    /// The server wants a pong
    Ping,
    /// The server answered a ping
    Pong,
    /// A result for an operation
    Data,
    /// An operation failed
    Error,
    /// An operation finished
    Complete,
    /// Something this protocol doesn't define
    Unknown,
}

/// The capabilities that differ between protocols.
///
/// A handler is selected once per connection, either from the protocol the
/// client was configured with or the one the server picked during the
/// websocket handshake.
pub trait ProtocolHandler: Send + Sync {
    /// Which protocol this handler speaks.
    fn protocol(&self) -> Protocol;

    /// The `connection_init` message, with an optional payload.
    fn init_message(&self, payload: Option<Value>) -> Envelope;

    /// The message that starts the operation `id`.
    fn start_message(&self, id: &str, request: Value) -> Envelope;

    /// The message that asks the server to stop the operation `id`.
    fn stop_message(&self, id: &str) -> Envelope;

    /// A protocol level ping, or `Error::Unsupported`.
    fn ping_message(&self, payload: Option<Value>) -> Result<Envelope, Error>;

    /// A protocol level pong, or `Error::Unsupported`.
    fn pong_message(&self, payload: Option<Value>) -> Result<Envelope, Error>;

    /// The message sent just before the client closes the socket.
    fn terminate_message(&self) -> Envelope;

    /// Interprets an incoming message.
    fn classify(&self, envelope: &Envelope) -> Event;

    /// True if no further messages will arrive for this message's operation.
    fn is_terminal(&self, envelope: &Envelope) -> bool {
        envelope.id.is_some() && matches!(self.classify(envelope), Event::Complete | Event::Error)
    }

    /// True if this message reports the failure of a single operation,
    /// rather than the whole connection.
    fn is_error_for_operation(&self, envelope: &Envelope) -> bool {
        envelope.id.is_some() && self.classify(envelope) == Event::Error
    }
}

/// A message the send queue has been asked to write, built into an
/// [`Envelope`] by whichever protocol the connection is using at the time.
#[derive(Debug)]
pub(crate) enum Outgoing {
    Start { id: String, payload: Value },
    Stop { id: String },
    Ping(Option<Value>),
    Pong(Option<Value>),
}

impl Outgoing {
    pub(crate) fn into_envelope(self, handler: &dyn ProtocolHandler) -> Result<Envelope, Error> {
        match self {
            Outgoing::Start { id, payload } => Ok(handler.start_message(&id, payload)),
            Outgoing::Stop { id } => Ok(handler.stop_message(&id)),
            Outgoing::Ping(payload) => handler.ping_message(payload),
            Outgoing::Pong(payload) => handler.pong_message(payload),
        }
    }
}

/// Runs the `connection_init` / `connection_ack` exchange on a freshly opened socket.
///
/// Returns the payload of the ack.  Pings that arrive before the ack are
/// answered, anything else that isn't an ack or a rejection is ignored.
pub(crate) async fn handshake(
    handler: &dyn ProtocolHandler,
    codec: &dyn Codec,
    sender: &mut dyn ObjectSafeSender,
    receiver: &mut dyn ObjectSafeReceiver,
    payload: Option<Value>,
) -> Result<Option<Value>, Error> {
    sender
        .send(Message::Text(codec.encode(&handler.init_message(payload))?))
        .await?;

    loop {
        match receiver.receive().await {
            None => return Err(Error::ConnectionDropped),
            Some(Message::Close { code, reason }) => {
                return Err(Error::Close(
                    code.unwrap_or_default(),
                    reason.unwrap_or_default(),
                ))
            }
            Some(Message::Binary(_)) => {
                return Err(Error::UnsupportedFrame("binary frame during handshake".into()))
            }
            Some(Message::Ping | Message::Pong) => {}
            Some(Message::Text(text)) => {
                let envelope = codec.decode(&text)?;
                match handler.classify(&envelope) {
                    Event::ConnectionAck => {
                        trace!("connection_ack received, handshake completed");
                        return Ok(envelope.payload);
                    }
                    Event::ConnectionError => {
                        return Err(Error::ConnectionRejected(envelope.payload));
                    }
                    Event::Ping => {
                        let pong = handler.pong_message(envelope.payload)?;
                        sender.send(Message::Text(codec.encode(&pong)?)).await?;
                    }
                    _ => {
                        trace!(
                            "ignoring {} message while waiting for connection_ack",
                            envelope.r#type
                        );
                    }
                }
            }
        }
    }
}
