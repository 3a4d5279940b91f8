use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_lite::{future, stream, Stream, StreamExt};
use serde_json::Value;

use crate::{graphql::GraphqlOperation, logging::trace, Error};

use super::{
    operation::{Attachment, ClientInner, ErrorAction, OperationEvent, OperationKind},
    production_future::read_from_producer,
};

/// A `futures::Stream` for a subscription.
///
/// Emits an item for each message received by the subscription.  Connection
/// failures are handled according to the client's [`ErrorAction`] policy: by
/// default they're emitted as an `Err` item and the subscription is started
/// again, with a new id, on a fresh connection.
///
/// Dropping the stream, or calling [`Subscription::stop`], asks the server to
/// stop the subscription.
#[pin_project::pin_project]
pub struct Subscription<Operation>
where
    Operation: GraphqlOperation,
{
    pub(in crate::client) stream: Option<stream::Boxed<Result<Operation::Response, Error>>>,
}

impl<Operation> Subscription<Operation>
where
    Operation: GraphqlOperation + Send + 'static,
    Operation::Response: Send + 'static,
{
    pub(super) fn new(
        client: Arc<ClientInner>,
        operation: Operation,
        payload: Value,
        attachment: Attachment,
    ) -> Self {
        let driver = Driver {
            client,
            operation,
            payload,
            attachment: Some(attachment),
            finished: false,
        };

        Subscription {
            stream: Some(stream::unfold(driver, next_item).boxed()),
        }
    }

    /// Stops this subscription
    pub fn stop(self) {
        drop(self);
    }

    pub(super) fn join(mut self, future: future::Boxed<()>) -> Self {
        self.stream = self
            .stream
            .take()
            .map(|stream| join_stream(stream, future).boxed());
        self
    }
}

impl<Operation> Stream for Subscription<Operation>
where
    Operation: GraphqlOperation,
{
    type Item = Result<Operation::Response, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.project().stream.as_mut() {
            None => Poll::Ready(None),
            Some(stream) => stream.poll_next(cx),
        }
    }
}

/// The state behind a subscription stream: the operation, and whichever
/// attachment is currently running it.
struct Driver<Operation> {
    client: Arc<ClientInner>,
    operation: Operation,
    payload: Value,
    attachment: Option<Attachment>,
    finished: bool,
}

impl<Operation> Driver<Operation>
where
    Operation: GraphqlOperation,
{
    fn decode(&self, response: Value) -> Result<Operation::Response, Error> {
        self.operation
            .decode(response)
            .map_err(|error| Error::Decode(error.to_string()))
    }

    /// Applies the client's policy to a connection failure.
    ///
    /// Returns the error if it should be delivered to the caller.
    fn connection_failed(&mut self, error: Error) -> Option<Error> {
        self.attachment = None;

        match self.client.error_action(OperationKind::Subscription, &error) {
            ErrorAction::Retry => {
                trace!("retrying subscription after {error}");
                None
            }
            ErrorAction::Report => Some(error),
            ErrorAction::Fail => {
                self.finished = true;
                Some(error)
            }
            ErrorAction::Complete => {
                self.finished = true;
                None
            }
        }
    }
}

async fn next_item<Operation>(
    mut driver: Driver<Operation>,
) -> Option<(Result<Operation::Response, Error>, Driver<Operation>)>
where
    Operation: GraphqlOperation,
{
    loop {
        if driver.finished {
            return None;
        }

        if driver.attachment.is_none() {
            match Attachment::attach(&driver.client, &driver.payload, OperationKind::Subscription)
                .await
            {
                Ok(attachment) => driver.attachment = Some(attachment),
                Err(error) => match driver.connection_failed(error) {
                    Some(error) => return Some((Err(error), driver)),
                    None => continue,
                },
            }
        }

        let Some(attachment) = driver.attachment.as_mut() else {
            continue;
        };

        match attachment.next_event().await {
            OperationEvent::Data(response) => {
                let item = driver.decode(response);
                return Some((item, driver));
            }
            OperationEvent::Error(response) => {
                driver.finished = true;
                let item = driver.decode(response);
                return Some((item, driver));
            }
            OperationEvent::Violation(error) => {
                driver.finished = true;
                return Some((Err(error), driver));
            }
            OperationEvent::Complete | OperationEvent::Closed => {
                driver.finished = true;
                driver.attachment = None;
                return None;
            }
            OperationEvent::Transport(error) => {
                if let Some(error) = driver.connection_failed(error) {
                    return Some((Err(error), driver));
                }
            }
        }
    }
}

/// Joins a future onto the execution of a stream returning a stream that also polls
/// the given future.
///
/// If the future ends the stream will still continue till completion but if the stream
/// ends the future will be cancelled.
///
/// This can be used when you have the receivng side of a channel and a future that sends
/// on that channel - combining the two into a single stream that'll run till the channel
/// is exhausted.  If you drop the stream you also cancel the underlying process.
fn join_stream<Item>(
    stream: stream::Boxed<Item>,
    future: future::Boxed<()>,
) -> impl Stream<Item = Item> {
    stream::unfold(ProducerState::Running(stream, future), producer_handler)
}

enum ProducerState<Item> {
    Running(stream::Boxed<Item>, future::Boxed<()>),
    Draining(stream::Boxed<Item>),
}

async fn producer_handler<Item>(
    mut state: ProducerState<Item>,
) -> Option<(Item, ProducerState<Item>)> {
    loop {
        match state {
            ProducerState::Running(mut stream, producer) => {
                match read_from_producer(stream.next(), producer).await {
                    Some((item, producer)) => {
                        return Some((item?, ProducerState::Running(stream, producer)));
                    }
                    None => state = ProducerState::Draining(stream),
                }
            }
            ProducerState::Draining(mut stream) => {
                return Some((stream.next().await?, ProducerState::Draining(stream)));
            }
        }
    }
}
