//! The wire format shared by both GraphQL over websocket protocols.
//!
//! Every message on the socket is a JSON object of the form
//! `{"id": ..., "type": ..., "payload": ...}`, where `id` is absent on
//! connection level messages (`connection_init`, `connection_ack`, `ping` etc.).
//! [`Envelope`] is that object with the payload left undecoded until
//! whoever owns the message knows what shape to expect.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// A single message as exchanged on the socket.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// The operation this message belongs to, absent for connection level messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The message type, e.g. `next` or `connection_ack`.
    pub r#type: String,

    /// The raw payload, decoded on demand with [`Envelope::decode_payload`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    /// A connection level message without a payload.
    pub fn control(r#type: &str) -> Self {
        Envelope {
            id: None,
            r#type: r#type.to_owned(),
            payload: None,
        }
    }

    /// A message for the operation with the given id.
    pub fn operation(id: &str, r#type: &str) -> Self {
        Envelope {
            id: Some(id.to_owned()),
            r#type: r#type.to_owned(),
            payload: None,
        }
    }

    /// Attaches a payload to this message.
    pub fn with_payload(self, payload: Option<Value>) -> Self {
        Envelope { payload, ..self }
    }

    /// Decodes the payload into a concrete type.
    ///
    /// A missing payload is treated as `null`.
    pub fn decode_payload<T>(&self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        T::deserialize(self.payload.as_ref().unwrap_or(&Value::Null))
            .map_err(|error| Error::Decode(error.to_string()))
    }
}

/// Converts [`Envelope`]s to and from the text that goes over the socket.
///
/// [`JsonCodec`] is used unless another codec is provided via
/// [`crate::ClientBuilder::codec`].
pub trait Codec: Send + Sync {
    /// Encodes an envelope into the text of a websocket message.
    fn encode(&self, envelope: &Envelope) -> Result<String, Error>;

    /// Decodes the text of a websocket message into an envelope.
    fn decode(&self, text: &str) -> Result<Envelope, Error>;
}

/// The default [`Codec`], backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<String, Error> {
        serde_json::to_string(envelope).map_err(|error| Error::Serializing(error.to_string()))
    }

    fn decode(&self, text: &str) -> Result<Envelope, Error> {
        serde_json::from_str(text).map_err(|error| Error::Decode(error.to_string()))
    }
}
