use std::{future::IntoFuture, sync::Arc};

use futures_lite::future;

use crate::{logging::trace, protocol::Outgoing};

use super::{
    keepalive::KeepAliveSettings,
    manager::{ConnectionManager, Inbound},
    receive_loop::ReceiveRunner,
    send_queue::{Delivery, SendQueue, SendWorker},
};

/// The background half of a [`Client`](super::Client).
///
/// This future owns the connection: it is the only thing that writes to or
/// reads from the socket, and it opens (and re-opens) the socket whenever an
/// operation needs one.  It must be spawned on an executor, or otherwise
/// polled, for the client to make progress.
///
/// It resolves once the client has been closed, or every [`Client`](super::Client)
/// and [`Subscription`](super::Subscription) has been dropped.
#[must_use]
pub struct ConnectionActor {
    worker: SendWorker,
    receiver: ReceiveRunner,
    keep_alive: KeepAliveSettings,
    pings: async_channel::Receiver<Inbound>,
    manager: Arc<ConnectionManager>,
    queue: SendQueue,
    finished: async_channel::Sender<()>,
}

impl ConnectionActor {
    pub(super) fn new(
        worker: SendWorker,
        receiver: ReceiveRunner,
        keep_alive: KeepAliveSettings,
        manager: Arc<ConnectionManager>,
        queue: SendQueue,
        finished: async_channel::Sender<()>,
    ) -> Self {
        let pings = manager
            .incoming()
            .subscribe(|inbound: &Inbound| inbound.event == crate::protocol::Event::Ping);

        ConnectionActor {
            worker,
            receiver,
            keep_alive,
            pings,
            manager,
            queue,
            finished,
        }
    }

    async fn run(self) {
        let ConnectionActor {
            worker,
            receiver,
            keep_alive,
            pings,
            manager,
            queue,
            finished,
        } = self;

        let responder = answer_pings(pings, queue.clone());
        let keep_alive = keep_alive.run(manager, queue);

        future::zip(
            future::zip(worker.run(), receiver.run()),
            future::zip(responder, keep_alive),
        )
        .await;

        trace!("connection actor finished");
        drop(finished);
    }
}

impl IntoFuture for ConnectionActor {
    type Output = ();

    type IntoFuture = future::Boxed<()>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.run())
    }
}

/// Answers server pings with a pong carrying the same payload.
async fn answer_pings(pings: async_channel::Receiver<Inbound>, queue: SendQueue) {
    while let Ok(ping) = pings.recv().await {
        trace!("answering ping");
        drop(queue.enqueue(
            Outgoing::Pong(ping.envelope.payload),
            Delivery::IfConnected,
        ));
    }
}
