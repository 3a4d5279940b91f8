use futures_lite::{Stream, StreamExt};
use futures_sink::Sink;
use tungstenite::protocol::CloseFrame;

use crate::{
    client::{ConnectionReceiver, ConnectionSender, Message},
    logging::warning,
    sink_ext::SinkExt,
    Error,
};

#[cfg(feature = "async-tungstenite")]
mod connector;

#[cfg(feature = "async-tungstenite")]
pub use self::connector::TungsteniteConnector;

#[cfg_attr(docsrs, doc(cfg(feature = "tungstenite")))]
impl<T> ConnectionSender for T
where
    T: Sink<tungstenite::Message> + Send + Unpin,
    <T as Sink<tungstenite::Message>>::Error: std::fmt::Display,
{
    async fn send(&mut self, message: Message) -> Result<(), Error> {
        <Self as SinkExt<tungstenite::Message>>::send(self, message.into())
            .await
            .map_err(|error| Error::Send(error.to_string()))
    }
}

#[cfg_attr(docsrs, doc(cfg(feature = "tungstenite")))]
impl<T> ConnectionReceiver for T
where
    T: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Send + Unpin,
{
    async fn receive(&mut self) -> Option<Message> {
        loop {
            match self.next().await? {
                Ok(tungstenite::Message::Text(text)) => return Some(Message::Text(text)),
                Ok(tungstenite::Message::Binary(data)) => return Some(Message::Binary(data)),
                Ok(tungstenite::Message::Ping(_)) => return Some(Message::Ping),
                Ok(tungstenite::Message::Pong(_)) => return Some(Message::Pong),
                Ok(tungstenite::Message::Close(frame)) => {
                    return Some(Message::Close {
                        code: frame.as_ref().map(|frame| frame.code.into()),
                        reason: frame.map(|frame| frame.reason.into_owned()),
                    });
                }
                // Raw frames only show up when reading, never from a
                // configured client, and fragmented messages arrive whole.
                Ok(tungstenite::Message::Frame(_)) => continue,
                Err(error) => {
                    #[allow(unused)]
                    let error = error;
                    warning!("error receiving message: {error:?}");
                    return None;
                }
            }
        }
    }
}

impl From<Message> for tungstenite::Message {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => tungstenite::Message::Text(text),
            Message::Binary(data) => tungstenite::Message::Binary(data),
            Message::Close { code, reason } => {
                tungstenite::Message::Close(code.map(|code| CloseFrame {
                    code: code.into(),
                    reason: reason.unwrap_or_default().into(),
                }))
            }
            Message::Ping => tungstenite::Message::Ping(vec![]),
            Message::Pong => tungstenite::Message::Pong(vec![]),
        }
    }
}
