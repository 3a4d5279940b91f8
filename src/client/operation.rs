use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use futures_lite::future;
use serde_json::Value;

use crate::{
    graphql::error_response,
    logging::{debug, trace},
    protocol::{Event, Outgoing},
    Error,
};

use super::{
    manager::{ConnectionManager, Inbound},
    operation_id::OperationId,
    send_queue::{Delivery, SendQueue},
};

/// What an operation should do when the connection under it fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorAction {
    /// Swallow the error and start the operation again, reconnecting (with
    /// backoff) as needed.
    Retry,
    /// Deliver the error to the caller, then start the operation again.
    Report,
    /// Deliver the error to the caller and end the operation.
    Fail,
    /// End the operation without an error.
    Complete,
}

pub(crate) type ErrorHandler = Arc<dyn Fn(&Error) -> ErrorAction + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OperationKind {
    OneShot,
    Subscription,
}

impl OperationKind {
    fn default_action(self) -> ErrorAction {
        match self {
            OperationKind::OneShot => ErrorAction::Fail,
            OperationKind::Subscription => ErrorAction::Report,
        }
    }
}

struct SharedOperation {
    id: String,
    /// The connection the operation was started on
    generation: u64,
    consumers: usize,
}

/// Hands out operation ids, and tracks the subscriptions identical requests
/// can join, keyed by their serialized request.
///
/// Shared with the receive loop, which takes operations out as soon as the
/// server ends them.
pub(crate) struct OperationRegistry {
    next_id: AtomicUsize,
    shared: Mutex<HashMap<String, SharedOperation>>,
}

impl OperationRegistry {
    pub(crate) fn new() -> Self {
        OperationRegistry {
            next_id: AtomicUsize::new(1),
            shared: Mutex::new(HashMap::new()),
        }
    }

    fn next_id(&self) -> String {
        loop {
            let next = self.next_id.fetch_add(1, Ordering::Relaxed);
            if let Some(id) = OperationId::new(next) {
                return id.to_string();
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SharedOperation>> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Joins the operation for `key` running on connection `generation`, or
    /// registers a new one.
    ///
    /// Returns the operation id, and whether the caller needs to start it.
    pub(crate) fn join_or_register(&self, key: &str, generation: u64) -> (String, bool) {
        let mut shared = self.lock();
        if let Some(operation) = shared
            .get_mut(key)
            .filter(|operation| operation.generation == generation)
        {
            operation.consumers += 1;
            return (operation.id.clone(), false);
        }

        let id = self.next_id();
        shared.insert(
            key.to_owned(),
            SharedOperation {
                id: id.clone(),
                generation,
                consumers: 1,
            },
        );
        (id, true)
    }

    /// True if `id` can still be joined through `key`.
    pub(crate) fn is_joinable(&self, key: &str, id: &str) -> bool {
        self.lock().get(key).is_some_and(|operation| operation.id == id)
    }

    /// Removes one consumer of `id`.  Returns true if it was the last one.
    fn release(&self, key: &str, id: &str) -> bool {
        let mut shared = self.lock();
        let Some(operation) = shared.get_mut(key).filter(|operation| operation.id == id) else {
            return false;
        };

        operation.consumers -= 1;
        if operation.consumers == 0 {
            shared.remove(key);
            return true;
        }
        false
    }

    /// Stops new callers joining `id`, which is over.  Returns false if they
    /// already couldn't.
    fn forget(&self, key: &str, id: &str) -> bool {
        let mut shared = self.lock();
        if shared.get(key).is_some_and(|operation| operation.id == id) {
            shared.remove(key);
            return true;
        }
        false
    }

    /// The server has ended `id`.
    pub(crate) fn finished(&self, id: &str) {
        self.lock().retain(|_, operation| operation.id != id);
    }
}

/// The state shared by every handle to a client.
pub(crate) struct ClientInner {
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) queue: SendQueue,
    operations: Arc<OperationRegistry>,
    on_error: Option<ErrorHandler>,
}

impl ClientInner {
    pub(crate) fn new(
        manager: Arc<ConnectionManager>,
        queue: SendQueue,
        operations: Arc<OperationRegistry>,
        on_error: Option<ErrorHandler>,
    ) -> Self {
        ClientInner {
            manager,
            queue,
            operations,
            on_error,
        }
    }

    /// Decides what an operation of `kind` does about a connection failure.
    pub(crate) fn error_action(&self, kind: OperationKind, error: &Error) -> ErrorAction {
        if error.is_cancellation() || self.manager.is_shutting_down() {
            return ErrorAction::Complete;
        }
        match &self.on_error {
            Some(handler) => handler(error),
            None => kind.default_action(),
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if self.manager.request_shutdown() {
            debug!("last client handle dropped, shutting down");
        }
    }
}

/// What happened next to an attached operation.
#[derive(Debug)]
pub(crate) enum OperationEvent {
    /// A result, as sent by the server
    Data(Value),
    /// The operation failed.  Carries the errors as a response body.
    Error(Value),
    /// The server finished the operation
    Complete,
    /// The server sent something that makes no sense for an operation
    Violation(Error),
    /// The connection failed
    Transport(Error),
    /// The client shut down
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AttachState {
    Live,
    /// The server considers the operation over, the connection carrying it is
    /// gone, or it has already been stopped
    Ended,
}

/// One caller's view of an operation running on the current connection.
///
/// Dropping an attachment detaches from the operation and, if it was the last
/// consumer of a subscription the server is still running, asks the server
/// to stop it.
pub(crate) struct Attachment {
    client: Arc<ClientInner>,
    id: String,
    /// The dedup key, for subscriptions
    key: Option<String>,
    kind: OperationKind,
    messages: async_channel::Receiver<Inbound>,
    errors: async_channel::Receiver<Error>,
    state: AttachState,
}

impl Attachment {
    /// Starts (or joins) an operation, connecting first if needed.
    pub(crate) async fn attach(
        client: &Arc<ClientInner>,
        payload: &Value,
        kind: OperationKind,
    ) -> Result<Attachment, Error> {
        let errors = client.manager.errors().subscribe_all();

        loop {
            client.queue.ensure_connected().await?;

            // Anything in here came from attempts before the one we're using.
            while errors.try_recv().is_ok() {}

            let Some(generation) = client.manager.current_generation() else {
                trace!("connection lost before operation could start, reconnecting");
                continue;
            };

            let (id, is_new, key) = match kind {
                OperationKind::OneShot => (client.operations.next_id(), true, None),
                OperationKind::Subscription => {
                    let key = dedup_key(payload);
                    let (id, is_new) = client.operations.join_or_register(&key, generation);
                    (id, is_new, Some(key))
                }
            };

            let filter_id = id.clone();
            let messages = client.manager.incoming().subscribe(move |inbound: &Inbound| {
                inbound.envelope.id.as_deref() == Some(filter_id.as_str())
            });

            let attachment = Attachment {
                client: Arc::clone(client),
                id,
                key,
                kind,
                messages,
                errors: errors.clone(),
                state: AttachState::Live,
            };

            if !is_new {
                if !attachment.is_joinable() {
                    trace!("operation {} ended before it could be joined", attachment.id);
                    drop(attachment.ended());
                    continue;
                }
                trace!("joined running operation {}", attachment.id);
                return Ok(attachment);
            }

            let started = client
                .queue
                .enqueue(
                    Outgoing::Start {
                        id: attachment.id.clone(),
                        payload: payload.clone(),
                    },
                    Delivery::IfConnected,
                )
                .wait()
                .await;

            match started {
                Ok(()) => {
                    trace!("started operation {}", attachment.id);
                    return Ok(attachment);
                }
                Err(Error::NotConnected) => {
                    drop(attachment.never_started());
                    continue;
                }
                Err(error) => {
                    drop(attachment.never_started());
                    return Err(error);
                }
            }
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the next thing to happen to this operation.
    ///
    /// Messages already received are delivered before any connection failure.
    pub(crate) async fn next_event(&mut self) -> OperationEvent {
        if self.state != AttachState::Live {
            return OperationEvent::Closed;
        }

        enum Next {
            Message(Option<Inbound>),
            Failure(Option<Error>),
        }

        let next = future::or(
            async { Next::Message(self.messages.recv().await.ok()) },
            async { Next::Failure(self.errors.recv().await.ok()) },
        )
        .await;

        match next {
            Next::Message(Some(inbound)) => self.handle_message(inbound),
            Next::Failure(Some(error)) => {
                self.end();
                OperationEvent::Transport(error)
            }
            Next::Message(None) | Next::Failure(None) => {
                self.state = AttachState::Ended;
                OperationEvent::Closed
            }
        }
    }

    fn handle_message(&mut self, inbound: Inbound) -> OperationEvent {
        let Inbound {
            envelope, event, ..
        } = inbound;

        match event {
            Event::Data => OperationEvent::Data(envelope.payload.unwrap_or(Value::Null)),
            Event::Error => {
                self.end();
                OperationEvent::Error(error_response(envelope.payload))
            }
            Event::Complete => {
                self.end();
                OperationEvent::Complete
            }
            _ => {
                self.abandon();
                OperationEvent::Violation(Error::ProtocolViolation(format!(
                    "unexpected {} message for operation {}",
                    envelope.r#type, self.id
                )))
            }
        }
    }

    fn is_joinable(&self) -> bool {
        self.key
            .as_ref()
            .is_some_and(|key| self.client.operations.is_joinable(key, &self.id))
    }

    fn end(&mut self) {
        self.state = AttachState::Ended;
        if let Some(key) = &self.key {
            self.client.operations.forget(key, &self.id);
        }
    }

    /// Stops listening to an operation the server is misbehaving on.
    ///
    /// Every consumer sees the same message, so only the first one to get here
    /// asks the server to stop it.
    fn abandon(&mut self) {
        self.state = AttachState::Ended;
        let first = match &self.key {
            Some(key) => self.client.operations.forget(key, &self.id),
            None => true,
        };
        if first {
            self.stop();
        }
    }

    fn stop(&self) {
        trace!("stopping operation {}", self.id);
        drop(self.client.queue.enqueue(
            Outgoing::Stop {
                id: self.id.clone(),
            },
            Delivery::IfConnected,
        ));
    }

    /// Marks the operation as over so dropping it sends nothing.
    fn ended(mut self) -> Self {
        self.state = AttachState::Ended;
        self
    }

    /// Takes an operation whose start message never went out back out of the
    /// registry, so nobody else joins it.
    fn never_started(self) -> Self {
        if let Some(key) = &self.key {
            self.client.operations.forget(key, &self.id);
        }
        self.ended()
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        let last = match &self.key {
            Some(key) => self.client.operations.release(key, &self.id),
            None => true,
        };

        if !last || self.state == AttachState::Ended || self.kind == OperationKind::OneShot {
            return;
        }
        if self.client.manager.current_generation().is_none() {
            return;
        }

        self.stop();
    }
}

/// Operations that serialize to equal JSON are the same operation.
///
/// Object keys are sorted so the key doesn't depend on field order.
fn dedup_key(payload: &Value) -> String {
    canonical(payload).to_string()
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries = object.iter().collect::<Vec<_>>();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key.clone(), canonical(value)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use futures_lite::future::block_on;
    use serde_json::json;

    use super::*;
    use crate::{client::send_queue::Command, protocol::Protocol};

    fn client() -> ClientInner {
        let (manager, _finished) = ConnectionManager::new(1);
        let manager = Arc::new(manager);
        let (queue, _commands) = SendQueue::new(Arc::clone(&manager));
        ClientInner::new(manager, queue, Arc::new(OperationRegistry::new()), None)
    }

    #[test]
    fn equal_requests_share_an_id() {
        let operations = OperationRegistry::new();
        let key = dedup_key(&json!({
            "query": "subscription { books }",
            "variables": {"a": 1, "b": 2}
        }));
        let reordered = dedup_key(&json!({
            "variables": {"b": 2, "a": 1},
            "query": "subscription { books }"
        }));
        assert_eq!(key, reordered);

        let (first, first_is_new) = operations.join_or_register(&key, 1);
        let (second, second_is_new) = operations.join_or_register(&key, 1);

        assert_eq!(first, second);
        assert!(first_is_new);
        assert!(!second_is_new);

        assert!(!operations.release(&key, &first));
        assert!(operations.release(&key, &first));
    }

    #[test]
    fn finished_operations_are_not_joined() {
        let operations = OperationRegistry::new();
        let key = dedup_key(&json!({"query": "subscription { books }"}));

        let (first, _) = operations.join_or_register(&key, 1);
        assert!(operations.forget(&key, &first));
        assert!(!operations.forget(&key, &first));
        let (second, is_new) = operations.join_or_register(&key, 1);

        assert!(is_new);
        assert_ne!(first, second);
        assert!(!operations.release(&key, &first));

        operations.finished(&second);
        assert!(!operations.is_joinable(&key, &second));
        let (third, is_new) = operations.join_or_register(&key, 1);
        assert!(is_new);
        assert_ne!(second, third);
    }

    #[test]
    fn operations_from_earlier_connections_are_not_joined() {
        let operations = OperationRegistry::new();
        let key = dedup_key(&json!({"query": "subscription { books }"}));

        let (first, _) = operations.join_or_register(&key, 1);
        let (second, is_new) = operations.join_or_register(&key, 2);

        assert!(is_new);
        assert_ne!(first, second);
        assert!(!operations.release(&key, &first));
        assert!(operations.release(&key, &second));
    }

    #[test]
    fn subscriptions_that_never_started_are_not_joined() {
        let (manager, _finished) = ConnectionManager::new(4);
        let manager = Arc::new(manager);
        manager.begin_connecting();
        let generation = manager.connected(Protocol::GraphqlTransportWs);
        let (queue, commands) = SendQueue::new(Arc::clone(&manager));
        let operations = Arc::new(OperationRegistry::new());
        let client = Arc::new(ClientInner::new(
            manager,
            queue,
            Arc::clone(&operations),
            None,
        ));
        let payload = json!({"query": "subscription { books }"});
        let key = dedup_key(&payload);

        let worker = async {
            let Ok(Command::Send { done, .. }) = commands.recv().await else {
                panic!("expected the first start");
            };
            // Another caller joins while the start is in flight, then the start fails.
            let (joined, is_new) = operations.join_or_register(&key, generation);
            assert!(!is_new);
            done.try_send(Err(Error::NotConnected)).unwrap();

            let Ok(Command::Send {
                message: Outgoing::Start { id, .. },
                done,
                ..
            }) = commands.recv().await
            else {
                panic!("expected the start to be retried");
            };
            assert_ne!(id, joined);
            done.try_send(Ok(())).unwrap();
            id
        };

        let (attachment, started) = block_on(future::zip(
            Attachment::attach(&client, &payload, OperationKind::Subscription),
            worker,
        ));

        assert_eq!(attachment.unwrap().id(), started);
    }

    #[test]
    fn ids_are_never_reused() {
        let operations = OperationRegistry::new();
        let ids = (0..100)
            .map(|_| operations.next_id())
            .collect::<std::collections::HashSet<_>>();

        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn default_error_actions() {
        let client = client();
        let error = Error::ConnectionDropped;

        assert_eq!(
            client.error_action(OperationKind::Subscription, &error),
            ErrorAction::Report
        );
        assert_eq!(
            client.error_action(OperationKind::OneShot, &error),
            ErrorAction::Fail
        );
        assert_eq!(
            client.error_action(OperationKind::Subscription, &Error::Closed),
            ErrorAction::Complete
        );
    }

    #[test]
    fn custom_handler_is_consulted() {
        let (manager, _finished) = ConnectionManager::new(1);
        let manager = Arc::new(manager);
        let (queue, _commands) = SendQueue::new(Arc::clone(&manager));
        let client = ClientInner::new(
            manager,
            queue,
            Arc::new(OperationRegistry::new()),
            Some(Arc::new(|_: &Error| ErrorAction::Retry)),
        );

        assert_eq!(
            client.error_action(OperationKind::OneShot, &Error::ConnectionDropped),
            ErrorAction::Retry
        );

        client.manager.request_shutdown();
        assert_eq!(
            client.error_action(OperationKind::OneShot, &Error::ConnectionDropped),
            ErrorAction::Complete
        );
    }
}
