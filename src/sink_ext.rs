use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_lite::ready;
use futures_sink::Sink;

/// The one method of `futures::SinkExt` the websocket adapters need, so that
/// `futures` itself isn't a dependency.
pub(crate) trait SinkExt<Item>: Sink<Item> {
    /// Writes `item` and flushes the sink.
    fn send(&mut self, item: Item) -> SendAndFlush<'_, Self, Item>
    where
        Self: Unpin,
    {
        SendAndFlush {
            sink: self,
            item: Some(item),
        }
    }
}

impl<Item, T> SinkExt<Item> for T where T: Sink<Item> {}

#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub(crate) struct SendAndFlush<'a, Si: ?Sized, Item> {
    sink: &'a mut Si,
    item: Option<Item>,
}

// The sink is only ever used through `Pin::new`, which needs it to be `Unpin` anyway.
impl<Si: Unpin + ?Sized, Item> Unpin for SendAndFlush<'_, Si, Item> {}

impl<Si: Sink<Item> + Unpin + ?Sized, Item> Future for SendAndFlush<'_, Si, Item> {
    type Output = Result<(), Si::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut sink = Pin::new(&mut *this.sink);

        if this.item.is_some() {
            ready!(sink.as_mut().poll_ready(cx))?;
            if let Some(item) = this.item.take() {
                sink.as_mut().start_send(item)?;
            }
        }

        sink.poll_flush(cx)
    }
}
