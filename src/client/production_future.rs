use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Polls `read_future` while also driving `producer`, which is expected to be
/// what makes `read_future` progress.
///
/// Resolves to the output of `read_future` along with the still running
/// producer, or `None` if the producer finished first.
pub(super) fn read_from_producer<ReadFuture, Producer>(
    read_future: ReadFuture,
    producer: Producer,
) -> ProducerRead<ReadFuture, Producer>
where
    ReadFuture: Future,
    Producer: Future<Output = ()> + Unpin,
{
    ProducerRead {
        read_future,
        producer: Some(producer),
    }
}

#[pin_project::pin_project]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub(super) struct ProducerRead<ReadFuture, Producer> {
    #[pin]
    read_future: ReadFuture,
    producer: Option<Producer>,
}

impl<ReadFuture, Producer> Future for ProducerRead<ReadFuture, Producer>
where
    ReadFuture: Future,
    Producer: Future<Output = ()> + Unpin,
{
    type Output = Option<(ReadFuture::Output, Producer)>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        if let Poll::Ready(output) = this.read_future.poll(cx) {
            return Poll::Ready(this.producer.take().map(|producer| (output, producer)));
        }

        let Some(producer) = this.producer.as_mut() else {
            return Poll::Ready(None);
        };

        if Pin::new(producer).poll(cx).is_ready() {
            this.producer.take();
            return Poll::Ready(None);
        }

        Poll::Pending
    }
}
