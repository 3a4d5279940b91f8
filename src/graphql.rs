//! Payload shapes for GraphQL operations, and the trait that lets any
//! GraphQL client library describe its operations to this crate.
//!
//! [`Request`] & [`Response`] can be used directly for untyped documents.
//! Support is also provided for [`cynic`][cynic] & [`graphql_client`][graphql-client]
//! behind the `client-cynic` & `client-graphql-client` features.
//!
//! [cynic]: https://cynic-rs.dev
//! [graphql-client]: https://github.com/graphql-rust/graphql-client

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// An abstraction over GraphQL operations.
///
/// The serialized form of an operation is the payload of the `subscribe`
/// (or legacy `start`) message.  Two operations that serialize to the same
/// JSON are considered equal, which is what lets concurrent identical
/// subscriptions share one stream.
pub trait GraphqlOperation: Serialize {
    /// The actual response & error type of this operation.
    type Response;

    /// The error that will be returned from failed attempts to decode a `Response`.
    type Error: std::error::Error;

    /// Decodes the JSON response into the actual response that will be returned
    /// to users for this operation.
    ///
    /// Operation level errors from the server arrive here too, as
    /// `{"errors": [...]}` with no `data`.
    fn decode(&self, data: Value) -> Result<Self::Response, Self::Error>;
}

/// An untyped GraphQL request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// The GraphQL document
    pub query: String,
    /// Variables for the document, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
    /// The operation in the document to run, if there's more than one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
    /// Protocol extensions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl Request {
    /// Creates a request for the given document.
    pub fn new(query: impl Into<String>) -> Self {
        Request {
            query: query.into(),
            variables: None,
            operation_name: None,
            extensions: None,
        }
    }

    /// Sets the variables of this request.
    pub fn variables(self, variables: impl Serialize) -> Result<Self, Error> {
        Ok(Request {
            variables: Some(
                serde_json::to_value(variables)
                    .map_err(|error| Error::Serializing(error.to_string()))?,
            ),
            ..self
        })
    }

    /// Sets the operation name of this request.
    pub fn operation_name(self, name: impl Into<String>) -> Self {
        Request {
            operation_name: Some(name.into()),
            ..self
        }
    }
}

/// A GraphQL response.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct Response<Data = Value> {
    /// The data returned by the server, absent when the operation failed
    pub data: Option<Data>,
    /// Any errors reported by the server
    pub errors: Option<Vec<GraphqlError>>,
    /// Protocol extensions
    pub extensions: Option<Value>,
}

/// A single error from a GraphQL response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphqlError {
    /// A description of the error
    pub message: String,
    /// Where in the document the error occurred
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<Location>>,
    /// The path of the response field that failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,
    /// Additional, server specific details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

/// A position in a GraphQL document
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[allow(missing_docs)]
    pub line: u32,
    #[allow(missing_docs)]
    pub column: u32,
}

impl GraphqlOperation for Request {
    type Response = Response;

    type Error = serde_json::Error;

    fn decode(&self, data: Value) -> Result<Self::Response, Self::Error> {
        serde_json::from_value(data)
    }
}

/// Builds the response body that an operation level `error` message is
/// delivered as.
///
/// The successor protocol sends a list of errors, the legacy protocol
/// usually a single error object.
pub(crate) fn error_response(payload: Option<Value>) -> Value {
    let errors = match payload {
        Some(Value::Array(errors)) => errors,
        Some(Value::Null) | None => vec![],
        Some(error) => vec![error],
    };

    serde_json::json!({ "errors": errors })
}

#[cfg(feature = "client-cynic")]
mod cynic {
    use super::GraphqlOperation;

    impl<ResponseData, Variables> GraphqlOperation
        for ::cynic::StreamingOperation<ResponseData, Variables>
    where
        ResponseData: serde::de::DeserializeOwned,
        Variables: serde::Serialize,
    {
        type Response = ::cynic::GraphQlResponse<ResponseData>;

        type Error = serde_json::Error;

        fn decode(&self, response: serde_json::Value) -> Result<Self::Response, Self::Error> {
            serde_json::from_value(response)
        }
    }

    impl<ResponseData, Variables> GraphqlOperation for ::cynic::Operation<ResponseData, Variables>
    where
        ResponseData: serde::de::DeserializeOwned,
        Variables: serde::Serialize,
    {
        type Response = ::cynic::GraphQlResponse<ResponseData>;

        type Error = serde_json::Error;

        fn decode(&self, response: serde_json::Value) -> Result<Self::Response, Self::Error> {
            serde_json::from_value(response)
        }
    }
}

#[cfg(feature = "client-graphql-client")]
pub use self::graphql_client::GraphqlClientOperation;

#[cfg(feature = "client-graphql-client")]
mod graphql_client {
    use super::GraphqlOperation;
    use ::graphql_client::{GraphQLQuery, QueryBody, Response};
    use std::marker::PhantomData;

    /// A query, mutation or subscription built from a `GraphQLQuery`
    pub struct GraphqlClientOperation<Q: GraphQLQuery> {
        inner: QueryBody<Q::Variables>,
        phantom: PhantomData<Q>,
    }

    impl<Q: GraphQLQuery> GraphqlClientOperation<Q> {
        /// Constructs a GraphqlClientOperation
        pub fn new(variables: Q::Variables) -> Self {
            Self {
                inner: Q::build_query(variables),
                phantom: PhantomData,
            }
        }
    }

    impl<Q: GraphQLQuery> serde::Serialize for GraphqlClientOperation<Q> {
        fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: serde::Serializer,
        {
            self.inner.serialize(serializer)
        }
    }

    impl<Q: GraphQLQuery> GraphqlOperation for GraphqlClientOperation<Q> {
        type Response = Response<Q::ResponseData>;

        type Error = serde_json::Error;

        fn decode(&self, response: serde_json::Value) -> Result<Self::Response, Self::Error> {
            serde_json::from_value(response)
        }
    }
}
