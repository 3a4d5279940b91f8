use std::{
    future::IntoFuture,
    sync::{Arc, Mutex},
    time::Duration,
};

use assert_matches::assert_matches;
use futures_lite::StreamExt;
use graphql_ws_transport::{
    graphql::Request, protocol::Protocol, Client, ConnectionState, Error, ErrorAction, Message,
};
use mock_server::MockServer;
use serde_json::json;

mod mock_server;

fn books_subscription() -> Request {
    Request::new("subscription { books(mutationType: CREATED) { id } }")
}

#[tokio::test]
async fn nothing_connects_until_an_operation_needs_it() {
    let (server, connector) = MockServer::new();
    let (client, actor) = Client::builder().build(connector);
    tokio::spawn(actor.into_future());

    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!server.has_pending_connection());
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.protocol(), None);
    assert_matches!(client.ping(None).await, Err(Error::NotConnected));
}

#[tokio::test]
async fn upgrade_request_and_handshake_carry_the_configuration() {
    let (server, connector) = MockServer::new();
    let acks = Arc::new(Mutex::new(vec![]));
    let (client, actor) = Client::builder()
        .url("ws://localhost:8000/graphql")
        .header("Authorization", "Bearer abc")
        .configure_request(|request| request.headers.push(("X-Client".into(), "tests".into())))
        .payload(json!({"token": "abc"}))
        .unwrap()
        .on_connected({
            let acks = Arc::clone(&acks);
            move |payload| acks.lock().unwrap().push(payload.cloned())
        })
        .build(connector);
    tokio::spawn(actor.into_future());

    let mut states = client.state_changes();

    let (connected, init_payload) = tokio::join!(client.connect(), async {
        let connection = server.connection().await;
        let init = connection
            .accept_with(Some(json!({"server": "mock"})))
            .await;
        (connection, init)
    });
    connected.unwrap();
    let (_connection, init_payload) = init_payload;

    assert_eq!(init_payload, Some(json!({"token": "abc"})));
    assert_eq!(*acks.lock().unwrap(), vec![Some(json!({"server": "mock"}))]);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].url, "ws://localhost:8000/graphql");
    assert_eq!(
        requests[0].subprotocols,
        vec!["graphql-transport-ws", "graphql-ws"]
    );
    assert_eq!(
        requests[0].headers,
        vec![
            ("Authorization".to_owned(), "Bearer abc".to_owned()),
            ("X-Client".to_owned(), "tests".to_owned()),
        ]
    );

    assert_eq!(states.next().await, Some(ConnectionState::Connecting));
    assert_eq!(states.next().await, Some(ConnectionState::Connected));
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.protocol(), Some(Protocol::GraphqlTransportWs));
}

#[tokio::test]
async fn concurrent_connects_share_one_socket() {
    let (server, connector) = MockServer::new();
    let (client, actor) = Client::builder().build(connector);
    tokio::spawn(actor.into_future());

    let (first, second, _connection) =
        tokio::join!(client.connect(), client.connect(), server.accept());
    first.unwrap();
    second.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!server.has_pending_connection());
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn connecting_after_a_drop_opens_a_new_socket() {
    let (server, connector) = MockServer::new();
    let (client, actor) = Client::builder()
        .backoff(|_| Duration::ZERO)
        .build(connector);
    tokio::spawn(actor.into_future());

    let mut states = client.state_changes();

    let (connected, connection) = tokio::join!(client.connect(), server.accept());
    connected.unwrap();
    assert_eq!(states.next().await, Some(ConnectionState::Connecting));
    assert_eq!(states.next().await, Some(ConnectionState::Connected));

    drop(connection);
    assert_eq!(states.next().await, Some(ConnectionState::Disconnected));

    let (connected, _reconnection) = tokio::join!(client.connect(), server.accept());
    connected.unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server.requests().len(), 2);
}

#[tokio::test]
async fn init_payload_is_computed_for_every_connection() {
    let (server, connector) = MockServer::new();
    let tokens = Arc::new(Mutex::new(0));
    let (client, actor) = Client::builder()
        .backoff(|_| Duration::ZERO)
        .init_payload({
            let tokens = Arc::clone(&tokens);
            move || {
                let mut tokens = tokens.lock().unwrap();
                *tokens += 1;
                Some(json!({"token": *tokens}))
            }
        })
        .build(connector);
    tokio::spawn(actor.into_future());

    let (connected, first) = tokio::join!(client.connect(), async {
        let connection = server.connection().await;
        let init = connection.accept().await;
        (connection, init)
    });
    connected.unwrap();
    assert_eq!(first.1, Some(json!({"token": 1})));

    drop(first.0);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (connected, second) = tokio::join!(client.connect(), async {
        let connection = server.connection().await;
        let init = connection.accept().await;
        (connection, init)
    });
    connected.unwrap();
    assert_eq!(second.1, Some(json!({"token": 2})));
}

#[tokio::test]
async fn the_server_picks_the_protocol() {
    let (server, connector) = MockServer::selecting(Some("graphql-ws"));
    let (client, actor) = Client::builder().build(connector);
    tokio::spawn(actor.into_future());

    let (subscription, connection) =
        tokio::join!(client.subscribe(books_subscription()), server.accept());
    let _subscription = subscription.unwrap();

    assert_eq!(client.protocol(), Some(Protocol::GraphqlWs));
    connection.receive_start("start").await;
}

#[tokio::test]
async fn a_server_that_names_no_protocol_gets_graphql_transport_ws() {
    let (server, connector) = MockServer::selecting(None);
    let (client, actor) = Client::builder().build(connector);
    tokio::spawn(actor.into_future());

    let (connected, _connection) = tokio::join!(client.connect(), server.accept());
    connected.unwrap();

    assert_eq!(client.protocol(), Some(Protocol::GraphqlTransportWs));
}

#[tokio::test]
async fn a_server_ignoring_the_requested_protocol_is_rejected() {
    let (server, connector) = MockServer::selecting(Some("graphql-ws"));
    let (client, actor) = Client::builder()
        .protocol(Protocol::GraphqlTransportWs)
        .build(connector);
    tokio::spawn(actor.into_future());

    let (connected, _connection) = tokio::join!(client.connect(), server.connection());

    assert_matches!(connected, Err(Error::ProtocolViolation(_)));
    assert_eq!(
        server.requests()[0].subprotocols,
        vec!["graphql-transport-ws"]
    );
}

#[tokio::test]
async fn connection_errors_during_the_handshake_reject_the_connection() {
    let (server, connector) = MockServer::new();
    let (client, actor) = Client::builder()
        .protocol(Protocol::GraphqlWs)
        .build(connector);
    tokio::spawn(actor.into_future());

    let mut errors = client.connection_errors();

    let (subscription, _connection) =
        tokio::join!(client.subscribe(books_subscription()), async {
            let connection = server.connection().await;
            assert_eq!(connection.receive_json().await["type"], "connection_init");
            connection
                .send(json!({"type": "connection_error", "payload": {"message": "denied"}}))
                .await;
            connection
        });

    assert_matches!(
        subscription.err(),
        Some(Error::ConnectionRejected(Some(payload))) => {
            assert_eq!(payload, json!({"message": "denied"}))
        }
    );
    assert_matches!(errors.next().await, Some(Error::ConnectionRejected(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn a_missing_ack_times_out() {
    let (server, connector) = MockServer::new();
    let (client, actor) = Client::builder()
        .connection_init_timeout(Duration::from_millis(50))
        .build(connector);
    tokio::spawn(actor.into_future());

    let (connected, _connection) = tokio::join!(client.connect(), server.connection());

    assert_matches!(connected, Err(Error::Timeout(_)));
}

#[tokio::test]
async fn backoff_counts_attempts_since_the_last_good_connection() {
    let (server, connector) = MockServer::new();
    let attempts = Arc::new(Mutex::new(vec![]));
    let (client, actor) = Client::builder()
        .connection_init_timeout(Duration::from_millis(50))
        .backoff({
            let attempts = Arc::clone(&attempts);
            move |attempt| {
                attempts.lock().unwrap().push(attempt);
                Duration::ZERO
            }
        })
        .build(connector);
    tokio::spawn(actor.into_future());

    // Never acked, so this attempt fails.
    let (connected, _unacked) = tokio::join!(client.connect(), server.connection());
    assert_matches!(connected, Err(Error::Timeout(_)));

    let (connected, connection) = tokio::join!(client.connect(), server.accept());
    connected.unwrap();

    drop(connection);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (connected, _connection) = tokio::join!(client.connect(), server.accept());
    connected.unwrap();

    assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 2]);
}

#[tokio::test]
async fn close_says_goodbye_and_is_idempotent() {
    let (server, connector) = MockServer::new();
    let (client, actor) = Client::builder().build(connector);
    let actor = tokio::spawn(actor.into_future());

    let (subscription, connection) =
        tokio::join!(client.subscribe(books_subscription()), server.accept());
    let mut subscription = subscription.unwrap();
    connection.receive_start("subscribe").await;

    client.close().await;

    assert_eq!(connection.receive_json().await, json!({"type": "complete"}));
    assert_matches!(
        connection.receive().await,
        Message::Close {
            code: Some(1000),
            ..
        }
    );

    client.close().await;
    actor.await.unwrap();

    // Shutting down isn't a failure, so the stream just ends.
    assert_matches!(subscription.next().await, None);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_matches!(
        client.subscribe(books_subscription()).await.err(),
        Some(Error::Closed)
    );
    assert_matches!(
        client.execute(Request::new("{ id }")).await,
        Err(Error::Closed)
    );
}

#[tokio::test]
async fn dropping_every_client_stops_the_actor() {
    let (server, connector) = MockServer::new();
    let (client, actor) = Client::builder().build(connector);
    let actor = tokio::spawn(actor.into_future());

    let (connected, connection) = tokio::join!(client.connect(), server.accept());
    connected.unwrap();

    drop(client);

    tokio::time::timeout(Duration::from_secs(1), actor)
        .await
        .expect("actor kept running")
        .unwrap();
    assert_eq!(connection.receive_json().await, json!({"type": "complete"}));
}

#[tokio::test]
async fn silent_connections_are_dropped_by_keep_alive() {
    let (server, connector) = MockServer::new();
    let (client, actor) = Client::builder()
        .keep_alive_interval(Duration::from_millis(50))
        .keep_alive_retries(0)
        .on_connection_error(|_| ErrorAction::Fail)
        .build(connector);
    tokio::spawn(actor.into_future());

    let (subscription, connection) =
        tokio::join!(client.subscribe(books_subscription()), server.accept());
    let mut subscription = subscription.unwrap();
    connection.receive_start("subscribe").await;

    assert_matches!(subscription.next().await, Some(Err(Error::Timeout(_))));

    assert_eq!(connection.receive_json().await, json!({"type": "ping"}));
    assert_eq!(connection.receive_json().await, json!({"type": "ping"}));
}

#[tokio::test]
async fn traffic_keeps_the_connection_alive() {
    let (server, connector) = MockServer::new();
    let (client, actor) = Client::builder()
        .keep_alive_interval(Duration::from_millis(50))
        .keep_alive_retries(0)
        .build(connector);
    tokio::spawn(actor.into_future());

    let (connected, connection) = tokio::join!(client.connect(), server.accept());
    connected.unwrap();

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        connection.send(json!({"type": "pong"})).await;
    }

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_matches!(connection.try_receive(Duration::ZERO).await, None);
}
