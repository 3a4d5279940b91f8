use std::{fmt, future::Future, future::IntoFuture, sync::Arc, time::Duration};

use futures_lite::future;
use serde::Serialize;
use serde_json::Value;

use crate::{
    codec::{Codec, JsonCodec},
    graphql::GraphqlOperation,
    protocol::Protocol,
    Error,
};

use super::{
    actor::ConnectionActor,
    backoff::{default_backoff, BackoffFn},
    connection::{ConnectionRequest, Connector},
    keepalive::KeepAliveSettings,
    manager::ConnectionManager,
    operation::{ClientInner, ErrorAction, ErrorHandler, OperationRegistry},
    production_future::read_from_producer,
    receive_loop::ReceiveRunner,
    send_queue::{
        ConnectSettings, ConnectedHook, InitPayloadFn, RequestConfigurator, SendQueue, SendWorker,
    },
    Client, Subscription,
};

const DEFAULT_SUBSCRIPTION_BUFFER_SIZE: usize = 5;
const DEFAULT_CONNECTION_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builder for Graphql over Websocket clients
///
/// This can be used to configure the client prior to construction, but can also create
/// subscriptions directly in the case where users only need to run one per connection.
///
/// Nothing connects until the first operation (or [`Client::connect`]) needs a
/// connection, so building a client can't fail.
///
/// ```rust
/// use graphql_ws_transport::{Client, ClientBuilder};
/// #
/// # fn example() {
/// # let connector = graphql_ws_transport::__doc_utils::Connector;
/// let (client, actor) = ClientBuilder::new().url("ws://localhost:8000/ws").build(connector);
/// // or
/// # let connector = graphql_ws_transport::__doc_utils::Connector;
/// let (client, actor) = Client::builder().url("ws://localhost:8000/ws").build(connector);
/// # }
/// ```
#[derive(Clone, Default)]
pub struct ClientBuilder {
    url: String,
    protocol: Option<Protocol>,
    headers: Vec<(String, String)>,
    configure_request: Option<RequestConfigurator>,
    payload: Option<Value>,
    init_payload: Option<InitPayloadFn>,
    on_connected: Option<ConnectedHook>,
    backoff: Option<BackoffFn>,
    connection_init_timeout: Option<Duration>,
    subscription_buffer_size: Option<usize>,
    keep_alive: KeepAliveSettings,
    on_connection_error: Option<ErrorHandler>,
    codec: Option<Arc<dyn Codec>>,
}

impl super::Client {
    /// Creates a ClientBuilder.
    ///
    /// Same as calling `ClientBuilder::new()`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl ClientBuilder {
    /// Creates a ClientBuilder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The endpoint to connect to, passed to the [`Connector`] on every connect.
    pub fn url(self, url: impl Into<String>) -> Self {
        ClientBuilder {
            url: url.into(),
            ..self
        }
    }

    /// Requests a specific protocol.
    ///
    /// By default both protocols are offered and the one the server selects is
    /// used, falling back to `graphql-transport-ws` if the server doesn't say.
    pub fn protocol(self, protocol: Protocol) -> Self {
        ClientBuilder {
            protocol: Some(protocol),
            ..self
        }
    }

    /// Adds a header to every websocket upgrade request.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Customises each [`ConnectionRequest`] just before it's handed to the [`Connector`].
    pub fn configure_request(
        self,
        configure: impl Fn(&mut ConnectionRequest) + Send + Sync + 'static,
    ) -> Self {
        ClientBuilder {
            configure_request: Some(Arc::new(configure)),
            ..self
        }
    }

    /// Add payload to `connection_init`
    pub fn payload(self, payload: impl Serialize) -> Result<Self, Error> {
        Ok(Self {
            payload: Some(
                serde_json::to_value(payload)
                    .map_err(|error| Error::Serializing(error.to_string()))?,
            ),
            ..self
        })
    }

    /// Computes the `connection_init` payload afresh for every connection, e.g. to
    /// pick up a refreshed token.  Takes precedence over [`ClientBuilder::payload`].
    pub fn init_payload(
        self,
        payload: impl Fn() -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        ClientBuilder {
            init_payload: Some(Arc::new(payload)),
            ..self
        }
    }

    /// Called with the `connection_ack` payload whenever a connection is established.
    pub fn on_connected(self, hook: impl Fn(Option<&Value>) + Send + Sync + 'static) -> Self {
        ClientBuilder {
            on_connected: Some(Arc::new(hook)),
            ..self
        }
    }

    /// Overrides the delay before each connection attempt.
    ///
    /// The function receives the attempt number, which starts at 1 and goes back
    /// to 1 after every successful connection.  Defaults to [`default_backoff`].
    pub fn backoff(self, backoff: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        ClientBuilder {
            backoff: Some(Arc::new(backoff)),
            ..self
        }
    }

    /// How long to wait for `connection_ack` before giving up on a connection.
    ///
    /// Defaults to 10 seconds.
    pub fn connection_init_timeout(self, timeout: Duration) -> Self {
        ClientBuilder {
            connection_init_timeout: Some(timeout),
            ..self
        }
    }

    /// Sets the size of the incoming message buffer that subscriptions created by this client will
    /// use
    pub fn subscription_buffer_size(self, new: usize) -> Self {
        ClientBuilder {
            subscription_buffer_size: Some(new),
            ..self
        }
    }

    /// Sets the interval between keep alives.
    ///
    /// Any incoming messages automatically reset this interval so keep alives may not be sent
    /// on busy connections even if this is set.
    pub fn keep_alive_interval(mut self, new: Duration) -> Self {
        self.keep_alive.interval = Some(new);
        self
    }

    /// The number of keepalive retries before a connection is considered broken.
    ///
    /// This defaults to 3, but has no effect if `keep_alive_interval` is not called.
    pub fn keep_alive_retries(mut self, count: usize) -> Self {
        self.keep_alive.retries = count;
        self
    }

    /// Decides what running operations do when the connection fails.
    ///
    /// Without a handler subscriptions report the error and then restart, and
    /// one shot operations fail.  The handler isn't consulted while the client
    /// is shutting down: operations just end.
    pub fn on_connection_error(
        self,
        handler: impl Fn(&Error) -> ErrorAction + Send + Sync + 'static,
    ) -> Self {
        ClientBuilder {
            on_connection_error: Some(Arc::new(handler)),
            ..self
        }
    }

    /// Replaces the JSON codec used for messages on the socket.
    pub fn codec(self, codec: impl Codec + 'static) -> Self {
        ClientBuilder {
            codec: Some(Arc::new(codec)),
            ..self
        }
    }

    /// Initialise a Client and use it to run a single subscription
    ///
    /// ```rust
    /// use graphql_ws_transport::{Client, ClientBuilder};
    /// # async fn example() -> Result<(), graphql_ws_transport::Error> {
    /// # let connector = graphql_ws_transport::__doc_utils::Connector;
    /// # let subscription = graphql_ws_transport::__doc_utils::Subscription;
    /// let stream = ClientBuilder::new()
    ///     .url("ws://localhost:8000/ws")
    ///     .subscribe(connector, subscription)
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// Note that this takes ownership of the client, so it cannot be
    /// used to run any more operations.
    ///
    /// If users want to run multiple operations on a connection they
    /// should `build` the `Client`.
    pub async fn subscribe<Conn, Operation>(
        self,
        connector: Conn,
        operation: Operation,
    ) -> Result<Subscription<Operation>, Error>
    where
        Conn: Connector + Send + Sync + 'static,
        Operation: GraphqlOperation + Send + 'static,
        Operation::Response: Send + 'static,
    {
        let (client, actor) = self.build(connector);

        let actor_future = actor.into_future();
        let subscribe_future = client.subscribe(operation);

        let (stream, actor_future) = run_startup(subscribe_future, actor_future).await?;

        Ok(stream.join(actor_future))
    }

    /// Constructs a Client
    ///
    /// Returns the client along with the [`ConnectionActor`] that runs its
    /// connection.  The actor must be spawned (or otherwise polled) somewhere -
    /// if the actor is dropped the client stops working.
    pub fn build<Conn>(self, connector: Conn) -> (Client, ConnectionActor)
    where
        Conn: Connector + Send + Sync + 'static,
    {
        let Self {
            url,
            protocol,
            headers,
            configure_request,
            payload,
            init_payload,
            on_connected,
            backoff,
            connection_init_timeout,
            subscription_buffer_size,
            keep_alive,
            on_connection_error,
            codec,
        } = self;

        let subscription_buffer_size =
            subscription_buffer_size.unwrap_or(DEFAULT_SUBSCRIPTION_BUFFER_SIZE);
        let codec = codec.unwrap_or_else(|| Arc::new(JsonCodec));
        let init_payload = init_payload.or_else(|| {
            payload.map(|payload| -> InitPayloadFn { Arc::new(move || Some(payload.clone())) })
        });

        let settings = ConnectSettings {
            url,
            protocol,
            headers,
            configure_request,
            init_payload,
            on_connected,
            backoff: backoff.unwrap_or_else(|| Arc::new(default_backoff)),
            init_timeout: connection_init_timeout.unwrap_or(DEFAULT_CONNECTION_INIT_TIMEOUT),
        };

        let (manager, finished) = ConnectionManager::new(subscription_buffer_size);
        let manager = Arc::new(manager);
        let (queue, commands) = SendQueue::new(Arc::clone(&manager));
        let (reader_sender, readers) = async_channel::unbounded();
        let operations = Arc::new(OperationRegistry::new());

        let worker = SendWorker::new(
            commands,
            Arc::clone(&manager),
            Box::new(connector),
            Arc::clone(&codec),
            settings,
            reader_sender,
        );
        let receiver = ReceiveRunner::new(
            readers,
            Arc::clone(&manager),
            queue.clone(),
            codec,
            Arc::clone(&operations),
        );

        let actor = ConnectionActor::new(
            worker,
            receiver,
            keep_alive,
            Arc::clone(&manager),
            queue.clone(),
            finished,
        );

        let client = Client::new_internal(ClientInner::new(
            manager,
            queue,
            operations,
            on_connection_error,
        ));

        (client, actor)
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("url", &self.url)
            .field("protocol", &self.protocol)
            .field("headers", &self.headers)
            .field("payload", &self.payload)
            .field("connection_init_timeout", &self.connection_init_timeout)
            .field("subscription_buffer_size", &self.subscription_buffer_size)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

async fn run_startup<SubscribeFut, Operation>(
    subscribe: SubscribeFut,
    actor: future::Boxed<()>,
) -> Result<(Subscription<Operation>, future::Boxed<()>), Error>
where
    SubscribeFut: Future<Output = Result<Subscription<Operation>, Error>>,
    Operation: GraphqlOperation,
{
    match read_from_producer(subscribe, actor).await {
        Some((Ok(subscription), actor)) => Ok((subscription, actor)),
        Some((Err(err), _)) => Err(err),
        None => Err(Error::Unknown(
            "actor ended before subscription started".into(),
        )),
    }
}
