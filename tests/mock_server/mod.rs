//! An in memory websocket server that tests can script frame by frame.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use graphql_ws_transport::{
    ConnectionReceiver, ConnectionRequest, ConnectionSender, Connector, Error, Message, Socket,
};
use serde_json::{json, Value};

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Which subprotocol the server claims to have selected.
#[derive(Clone)]
enum Selection {
    /// The first one the client offered
    FirstOffered,
    /// Always this one, or none at all
    Fixed(Option<String>),
}

pub struct MockServer {
    connections: async_channel::Receiver<ServerConnection>,
    requests: Arc<Mutex<Vec<ConnectionRequest>>>,
}

pub struct MockConnector {
    connections: async_channel::Sender<ServerConnection>,
    requests: Arc<Mutex<Vec<ConnectionRequest>>>,
    selection: Selection,
}

impl MockServer {
    /// A server that accepts whichever protocol the client prefers.
    pub fn new() -> (MockServer, MockConnector) {
        Self::with_selection(Selection::FirstOffered)
    }

    /// A server that always answers with `protocol`.
    #[allow(dead_code)]
    pub fn selecting(protocol: Option<&str>) -> (MockServer, MockConnector) {
        Self::with_selection(Selection::Fixed(protocol.map(str::to_owned)))
    }

    fn with_selection(selection: Selection) -> (MockServer, MockConnector) {
        let (sender, receiver) = async_channel::unbounded();
        let requests = Arc::new(Mutex::new(vec![]));

        (
            MockServer {
                connections: receiver,
                requests: Arc::clone(&requests),
            },
            MockConnector {
                connections: sender,
                requests,
                selection,
            },
        )
    }

    /// Waits for the client to open a socket.
    pub async fn connection(&self) -> ServerConnection {
        tokio::time::timeout(RECEIVE_TIMEOUT, self.connections.recv())
            .await
            .expect("client never connected")
            .expect("connector was dropped")
    }

    /// Waits for a socket and completes the handshake on it.
    #[allow(dead_code)]
    pub async fn accept(&self) -> ServerConnection {
        let connection = self.connection().await;
        connection.accept().await;
        connection
    }

    /// Every upgrade request the client has made so far.
    #[allow(dead_code)]
    pub fn requests(&self) -> Vec<ConnectionRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// True if the client opened a socket that hasn't been collected yet.
    #[allow(dead_code)]
    pub fn has_pending_connection(&self) -> bool {
        !self.connections.is_empty()
    }
}

impl Connector for MockConnector {
    type Sender = ClientSender;

    type Receiver = ClientReceiver;

    async fn connect(
        &self,
        request: ConnectionRequest,
    ) -> Result<Socket<ClientSender, ClientReceiver>, Error> {
        let protocol = match &self.selection {
            Selection::FirstOffered => request.subprotocols.first().cloned(),
            Selection::Fixed(protocol) => protocol.clone(),
        };
        self.requests.lock().unwrap().push(request);

        let (to_server, from_client) = async_channel::unbounded();
        let (to_client, from_server) = async_channel::unbounded();

        self.connections
            .send(ServerConnection {
                incoming: from_client,
                outgoing: to_client,
            })
            .await
            .map_err(|_| Error::Connect("server has shut down".into()))?;

        Ok(Socket {
            sender: ClientSender(to_server),
            receiver: ClientReceiver(from_server),
            protocol,
        })
    }
}

pub struct ClientSender(async_channel::Sender<Message>);

impl ConnectionSender for ClientSender {
    async fn send(&mut self, message: Message) -> Result<(), Error> {
        self.0
            .send(message)
            .await
            .map_err(|_| Error::Send("server hung up".into()))
    }
}

pub struct ClientReceiver(async_channel::Receiver<Message>);

impl ConnectionReceiver for ClientReceiver {
    async fn receive(&mut self) -> Option<Message> {
        self.0.recv().await.ok()
    }
}

/// The server end of one socket.  Dropping it drops the connection without a
/// close frame.
pub struct ServerConnection {
    incoming: async_channel::Receiver<Message>,
    outgoing: async_channel::Sender<Message>,
}

#[allow(dead_code)]
impl ServerConnection {
    /// Reads `connection_init`, answers `connection_ack` and returns the init payload.
    pub async fn accept(&self) -> Option<Value> {
        self.accept_with(None).await
    }

    pub async fn accept_with(&self, ack_payload: Option<Value>) -> Option<Value> {
        let init = self.receive_json().await;
        assert_eq!(init["type"], "connection_init");

        let mut ack = json!({"type": "connection_ack"});
        if let Some(payload) = ack_payload {
            ack["payload"] = payload;
        }
        self.send(ack).await;

        init.get("payload").cloned()
    }

    /// The next frame the client wrote.
    pub async fn receive(&self) -> Message {
        tokio::time::timeout(RECEIVE_TIMEOUT, self.incoming.recv())
            .await
            .expect("no message from client")
            .expect("client closed the socket")
    }

    /// The next frame the client wrote, which must be a text frame of JSON.
    pub async fn receive_json(&self) -> Value {
        match self.receive().await {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected a text frame, got {other:?}"),
        }
    }

    /// Reads a `subscribe` (or legacy `start`) message, returning its id.
    pub async fn receive_start(&self, expected_type: &str) -> String {
        let start = self.receive_json().await;
        assert_eq!(start["type"], expected_type, "unexpected message {start}");
        start["id"].as_str().unwrap().to_owned()
    }

    /// Waits briefly and returns whatever the client wrote, if anything.
    pub async fn try_receive(&self, wait: Duration) -> Option<Message> {
        tokio::time::timeout(wait, self.incoming.recv())
            .await
            .ok()
            .and_then(Result::ok)
    }

    pub async fn send(&self, message: Value) {
        self.outgoing
            .send(Message::Text(message.to_string()))
            .await
            .unwrap();
    }

    pub async fn send_frame(&self, message: Message) {
        self.outgoing.send(message).await.unwrap();
    }

    pub async fn close(&self, code: u16, reason: &str) {
        self.send_frame(Message::Close {
            code: Some(code),
            reason: Some(reason.into()),
        })
        .await;
    }

    /// True once the client has dropped its end of the socket.
    pub fn client_hung_up(&self) -> bool {
        self.incoming.is_closed() && self.incoming.is_empty()
    }
}
