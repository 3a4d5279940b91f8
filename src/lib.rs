//! # graphql-ws-transport
//!
//! graphql-ws-transport is an asynchronous GraphQL over websocket client
//! transport.  It runs any number of queries, mutations & subscriptions over
//! a single websocket connection, using either of the two protocols in use:
//!
//! - [graphql-transport-ws][protocol], from the graphql-ws library.
//! - The legacy [graphql-ws][legacy-protocol] protocol from
//!   subscriptions-transport-ws.
//!
//! The connection is opened when the first operation needs it, and re-opened
//! (with backoff) whenever an operation is started after it has dropped.
//! Identical subscriptions running at the same time share a single operation
//! on the server.
//!
//! It tries to be websocket client, graphql client _and_ async executor
//! agnostic and provides built in support for:
//!
//! - [Cynic][cynic] & [Graphql-Client][graphql-client] GraphQL clients.
//! - [async-tungstenite][async-tungstenite] websockets, on tokio.
//!
//! If you'd like to use another websocket client implement [`Connector`]
//! for it.
//!
//! [protocol]: https://github.com/enisdenjo/graphql-ws/blob/HEAD/PROTOCOL.md
//! [legacy-protocol]: https://github.com/apollographql/subscriptions-transport-ws/blob/master/PROTOCOL.md
//! [cynic]: https://cynic-rs.dev
//! [graphql-client]: https://github.com/graphql-rust/graphql-client
//! [async-tungstenite]: https://github.com/sdroege/async-tungstenite

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod client;
mod error;
mod logging;

pub mod codec;
pub mod graphql;
pub mod protocol;

#[cfg(feature = "tungstenite")]
mod native;
#[cfg(feature = "tungstenite")]
mod sink_ext;

#[doc(hidden)]
#[allow(missing_docs)]
#[path = "doc_utils.rs"]
pub mod __doc_utils;

pub use client::{
    default_backoff, Client, ClientBuilder, ConnectionActor, ConnectionReceiver,
    ConnectionRequest, ConnectionSender, ConnectionState, Connector, ErrorAction, Message,
    Socket, Subscription,
};
pub use error::Error;

#[cfg(feature = "async-tungstenite")]
pub use native::TungsteniteConnector;
