use std::sync::Arc;

use futures_lite::future;

use crate::{
    codec::Codec,
    logging::{trace, warning},
    protocol::{Event, ProtocolHandler},
    Error,
};

use super::{
    broadcast::Broadcaster,
    connection::{Message, ObjectSafeReceiver},
    manager::{ConnectionManager, Inbound},
    operation::OperationRegistry,
    send_queue::SendQueue,
};

/// The reading half of a freshly handshaken connection, passed from the send
/// worker to the receive runner.
pub(crate) struct ReaderHandoff {
    pub(crate) receiver: Box<dyn ObjectSafeReceiver>,
    pub(crate) handler: Arc<dyn ProtocolHandler>,
    pub(crate) generation: u64,
    /// Closed by the send worker when it tears the connection down itself.
    pub(crate) aborted: async_channel::Receiver<()>,
}

/// The only reader of the socket.
///
/// Runs one receive loop per connection, in turn, for as long as the send
/// worker keeps handing connections over.
pub(crate) struct ReceiveRunner {
    readers: async_channel::Receiver<ReaderHandoff>,
    manager: Arc<ConnectionManager>,
    queue: SendQueue,
    codec: Arc<dyn Codec>,
    operations: Arc<OperationRegistry>,
}

impl ReceiveRunner {
    pub(crate) fn new(
        readers: async_channel::Receiver<ReaderHandoff>,
        manager: Arc<ConnectionManager>,
        queue: SendQueue,
        codec: Arc<dyn Codec>,
        operations: Arc<OperationRegistry>,
    ) -> Self {
        ReceiveRunner {
            readers,
            manager,
            queue,
            codec,
            operations,
        }
    }

    pub(crate) async fn run(self) {
        while let Ok(ReaderHandoff {
            mut receiver,
            handler,
            generation,
            aborted,
        }) = self.readers.recv().await
        {
            let ended = future::or(
                async {
                    aborted.recv().await.ok();
                    None
                },
                async {
                    Some(
                        receive_loop(
                            receiver.as_mut(),
                            handler.as_ref(),
                            self.codec.as_ref(),
                            self.manager.incoming(),
                            &self.operations,
                        )
                        .await,
                    )
                },
            )
            .await;

            match ended {
                Some(error) => {
                    self.manager.connection_lost(generation, error);
                }
                None => trace!("receive loop for connection {generation} aborted"),
            }
            self.queue.connection_lost(generation);
        }
    }
}

/// Reads messages until the connection fails, publishing each one to the
/// operations listening for it.
///
/// Operations the server ends are taken out of `operations` before anyone
/// hears about it, so identical requests made from then on start afresh.
///
/// Returns the error that ended the connection.
pub(crate) async fn receive_loop(
    receiver: &mut dyn ObjectSafeReceiver,
    handler: &dyn ProtocolHandler,
    codec: &dyn Codec,
    incoming: &Broadcaster<Inbound>,
    operations: &OperationRegistry,
) -> Error {
    loop {
        let text = match receiver.receive().await {
            None => return Error::ConnectionDropped,
            Some(Message::Text(text)) => text,
            Some(Message::Close { code, reason }) => {
                return Error::Close(code.unwrap_or_default(), reason.unwrap_or_default())
            }
            Some(Message::Binary(_)) => {
                return Error::UnsupportedFrame("binary frames are not part of the protocol".into())
            }
            Some(Message::Ping | Message::Pong) => continue,
        };

        trace!("received {text}");

        let envelope = match codec.decode(&text) {
            Ok(envelope) => envelope,
            Err(error) => {
                warning!("couldn't decode incoming message: {error}");
                return error;
            }
        };

        let event = handler.classify(&envelope);
        match event {
            Event::ConnectionError => {
                warning!("connection level error from server: {:?}", envelope.payload);
            }
            Event::Unknown if envelope.id.is_none() => {
                warning!("ignoring unknown {} message", envelope.r#type);
            }
            _ => {}
        }

        let terminal = handler.is_terminal(&envelope);
        let id = envelope.id.clone();
        if terminal {
            if let Some(id) = &id {
                operations.finished(id);
            }
        }
        let delivered = incoming
            .publish(Inbound {
                envelope,
                event,
                terminal,
            })
            .await;

        if delivered == 0 {
            if let Some(id) = id {
                trace!("dropping message for unknown operation {id}");
            }
        }
    }
}
