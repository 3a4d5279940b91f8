use std::sync::Arc;

use futures_lite::{stream, StreamExt};
use serde::Serialize;
use serde_json::Value;

use crate::{
    graphql::GraphqlOperation,
    logging::debug,
    protocol::{Outgoing, Protocol},
    Error,
};

mod actor;
mod backoff;
mod broadcast;
mod builder;
mod connection;
mod keepalive;
mod manager;
mod operation;
mod operation_id;
mod production_future;
mod receive_loop;
mod send_queue;
mod subscription;

pub use self::{
    actor::ConnectionActor,
    backoff::default_backoff,
    builder::ClientBuilder,
    connection::{
        ConnectionReceiver, ConnectionRequest, ConnectionSender, Connector, Message, Socket,
    },
    manager::ConnectionState,
    operation::ErrorAction,
    subscription::Subscription,
};

pub(crate) use self::connection::{ObjectSafeReceiver, ObjectSafeSender};

use self::{
    operation::{Attachment, ClientInner, OperationEvent, OperationKind},
    send_queue::Delivery,
};

/// A GraphQL over Websocket client
///
/// Runs any number of queries, mutations & subscriptions over a single
/// websocket connection, opening (and re-opening) the connection as needed.
///
/// ```rust,no_run
/// use graphql_ws_transport::{graphql::Request, Client};
/// use futures_lite::StreamExt;
/// # async fn example() -> Result<(), graphql_ws_transport::Error> {
/// # let connector = graphql_ws_transport::__doc_utils::Connector;
/// let (client, actor) = Client::builder().url("ws://localhost:8000/ws").build(connector);
///
/// # graphql_ws_transport::__doc_utils::spawn(std::future::IntoFuture::into_future(actor));
/// let mut stream = client.subscribe(Request::new("subscription { books { id } }")).await?;
///
/// while let Some(item) = stream.next().await {
///     println!("{:?}", item);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub(super) fn new_internal(inner: ClientInner) -> Self {
        Client {
            inner: Arc::new(inner),
        }
    }

    /// Starts a streaming operation on this client.
    ///
    /// Identical subscriptions that are running at the same time share one
    /// operation on the server, and every caller sees the same results.
    ///
    /// Returns a `Stream` of responses.  Failing to connect or start the
    /// subscription is returned as an error here, failures after that are
    /// handled as configured with [`ClientBuilder::on_connection_error`].
    pub async fn subscribe<Operation>(
        &self,
        op: Operation,
    ) -> Result<Subscription<Operation>, Error>
    where
        Operation: GraphqlOperation + Send + 'static,
        Operation::Response: Send + 'static,
    {
        let payload = serialize(&op)?;
        let attachment =
            Attachment::attach(&self.inner, &payload, OperationKind::Subscription).await?;

        Ok(Subscription::new(
            Arc::clone(&self.inner),
            op,
            payload,
            attachment,
        ))
    }

    /// Runs a single query or mutation.
    ///
    /// Resolves to the first response the server sends for the operation, or
    /// `None` if the server completed the operation without sending one.  If the
    /// server reports the operation failed, the response carries those errors.
    pub async fn execute<Operation>(
        &self,
        op: Operation,
    ) -> Result<Option<Operation::Response>, Error>
    where
        Operation: GraphqlOperation,
    {
        let payload = serialize(&op)?;
        let decode = |response: Value| {
            op.decode(response)
                .map_err(|error| Error::Decode(error.to_string()))
        };

        loop {
            let mut attachment =
                match Attachment::attach(&self.inner, &payload, OperationKind::OneShot).await {
                    Ok(attachment) => attachment,
                    Err(error) => match self.one_shot_failed(error) {
                        Some(outcome) => return outcome.map(|()| None),
                        None => continue,
                    },
                };

            match attachment.next_event().await {
                OperationEvent::Data(response) | OperationEvent::Error(response) => {
                    return decode(response).map(Some)
                }
                OperationEvent::Complete => return Ok(None),
                OperationEvent::Violation(error) => return Err(error),
                OperationEvent::Closed => return Err(Error::Closed),
                OperationEvent::Transport(error) => {
                    if let Some(outcome) = self.one_shot_failed(error) {
                        return outcome.map(|()| None);
                    }
                }
            }
            debug!("retrying operation {} after a connection failure", attachment.id());
        }
    }

    /// Applies the retry policy to a failed one shot operation.
    ///
    /// Returns `None` to retry, or what the operation should resolve to.
    fn one_shot_failed(&self, error: Error) -> Option<Result<(), Error>> {
        if error.is_cancellation() {
            return Some(Err(error));
        }
        match self.inner.error_action(OperationKind::OneShot, &error) {
            ErrorAction::Retry => None,
            ErrorAction::Report | ErrorAction::Fail => Some(Err(error)),
            ErrorAction::Complete => Some(Ok(())),
        }
    }

    /// Connects to the server, if not already connected.
    ///
    /// Operations connect on demand so calling this isn't required, but it can
    /// be used to surface connection problems early.
    pub async fn connect(&self) -> Result<(), Error> {
        self.inner.queue.ensure_connected().await
    }

    /// The current state of the connection.
    pub fn state(&self) -> ConnectionState {
        self.inner.manager.state()
    }

    /// A stream of connection state changes, starting from the next one.
    pub fn state_changes(&self) -> stream::Boxed<ConnectionState> {
        self.inner.manager.states().subscribe_all().boxed()
    }

    /// A stream of connection failures, starting from the next one.
    ///
    /// Failed connection attempts and connections lost after the handshake are
    /// both reported.
    pub fn connection_errors(&self) -> stream::Boxed<Error> {
        self.inner.manager.errors().subscribe_all().boxed()
    }

    /// The protocol of the current (or most recent) connection, if there's been one.
    pub fn protocol(&self) -> Option<Protocol> {
        self.inner.manager.protocol()
    }

    /// Sends a `ping`.
    ///
    /// Only `graphql-transport-ws` supports this, `graphql-ws` connections
    /// return `Error::Unsupported`.  Fails with `Error::NotConnected` if there's
    /// no connection.
    pub async fn ping(&self, payload: Option<Value>) -> Result<(), Error> {
        self.inner
            .queue
            .enqueue(Outgoing::Ping(payload), Delivery::IfConnected)
            .wait()
            .await
    }

    /// Sends an unsolicited `pong`, which servers treat as a one way heartbeat.
    ///
    /// Pings from the server are answered automatically, so there's no need to
    /// call this in response to them.
    pub async fn pong(&self, payload: Option<Value>) -> Result<(), Error> {
        self.inner
            .queue
            .enqueue(Outgoing::Pong(payload), Delivery::IfConnected)
            .wait()
            .await
    }

    /// Shuts the client down.
    ///
    /// Running operations end, queued messages are cancelled, and the server is
    /// sent a farewell before the socket is closed.  Resolves once the
    /// [`ConnectionActor`] has finished.  Calling this more than once is harmless.
    pub async fn close(&self) {
        if self.inner.manager.request_shutdown() {
            debug!("closing client");
        }
        self.inner.manager.finished().await;
    }
}

fn serialize(op: &impl Serialize) -> Result<Value, Error> {
    serde_json::to_value(op).map_err(|error| Error::Serializing(error.to_string()))
}
