use serde_json::Value;

use super::{Event, Protocol, ProtocolHandler};
use crate::{codec::Envelope, Error};

/// The `graphql-transport-ws` protocol, as spoken by graphql-ws.
///
/// Pings can be sent by either side at any time and must be answered with a
/// pong promptly.  `complete` is bidirectional.
#[derive(Clone, Copy, Debug, Default)]
pub struct GraphqlTransportWs;

impl ProtocolHandler for GraphqlTransportWs {
    fn protocol(&self) -> Protocol {
        Protocol::GraphqlTransportWs
    }

    fn init_message(&self, payload: Option<Value>) -> Envelope {
        Envelope::control("connection_init").with_payload(payload)
    }

    fn start_message(&self, id: &str, request: Value) -> Envelope {
        Envelope::operation(id, "subscribe").with_payload(Some(request))
    }

    fn stop_message(&self, id: &str) -> Envelope {
        Envelope::operation(id, "complete")
    }

    fn ping_message(&self, payload: Option<Value>) -> Result<Envelope, Error> {
        Ok(Envelope::control("ping").with_payload(payload))
    }

    fn pong_message(&self, payload: Option<Value>) -> Result<Envelope, Error> {
        Ok(Envelope::control("pong").with_payload(payload))
    }

    fn terminate_message(&self) -> Envelope {
        Envelope::control("complete")
    }

    fn classify(&self, envelope: &Envelope) -> Event {
        match (envelope.r#type.as_str(), envelope.id.is_some()) {
            ("connection_ack", _) => Event::ConnectionAck,
            ("connection_error", _) => Event::ConnectionError,
            ("ping", _) => Event::Ping,
            ("pong", _) => Event::Pong,
            ("next", true) => Event::Data,
            ("error", true) => Event::Error,
            ("complete", true) => Event::Complete,
            _ => Event::Unknown,
        }
    }
}
