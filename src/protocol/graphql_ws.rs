use serde_json::Value;

use super::{Event, Protocol, ProtocolHandler};
use crate::{codec::Envelope, Error};

/// The legacy `graphql-ws` protocol, as spoken by subscriptions-transport-ws.
///
/// Has no ping/pong: the server may send `ka` messages, which are informational.
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphqlWs;

impl ProtocolHandler for GraphqlWs {
    fn protocol(&self) -> Protocol {
        Protocol::GraphqlWs
    }

    fn init_message(&self, payload: Option<Value>) -> Envelope {
        Envelope::control("connection_init").with_payload(payload)
    }

    fn start_message(&self, id: &str, request: Value) -> Envelope {
        Envelope::operation(id, "start").with_payload(Some(request))
    }

    fn stop_message(&self, id: &str) -> Envelope {
        Envelope::operation(id, "stop")
    }

    fn ping_message(&self, _payload: Option<Value>) -> Result<Envelope, Error> {
        Err(Error::Unsupported("ping"))
    }

    fn pong_message(&self, _payload: Option<Value>) -> Result<Envelope, Error> {
        Err(Error::Unsupported("pong"))
    }

    fn terminate_message(&self) -> Envelope {
        Envelope::control("connection_terminate")
    }

    fn classify(&self, envelope: &Envelope) -> Event {
        match (envelope.r#type.as_str(), envelope.id.is_some()) {
            ("connection_ack", _) => Event::ConnectionAck,
            ("connection_error", _) => Event::ConnectionError,
            ("ka", _) => Event::KeepAlive,
            ("data", true) => Event::Data,
            // Older servers report connection failures as an `error` with no id
            ("error", false) => Event::ConnectionError,
            ("error", true) => Event::Error,
            ("complete", true) => Event::Complete,
            _ => Event::Unknown,
        }
    }
}
