//! Transport seam.
//!
//! The engine never talks to the network itself. Hosts supply a [`Fetcher`]
//! for queries and mutations and, optionally, a [`Subscriber`] for
//! subscription operations.

use crate::error::TransportError;
use crate::selection::OperationType;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request body of a GraphQL operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLPayload {
    pub query: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,

    #[serde(
        rename = "operationName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLPayload {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: None,
            operation_name: None,
            extensions: None,
        }
    }
}

/// Per-request metadata passed alongside the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    pub operation: OperationType,
    /// Content hash of the compiled document
    pub hash: String,
}

/// Location of an error in the query text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// A protocol-level error from the `errors` array of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ErrorLocation>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
        }
    }
}

/// Response body of a GraphQL operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<GraphQLError>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Map<String, Value>>,
}

impl ExecutionResult {
    /// Successful result carrying `data`.
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Whether the response carries a non-empty `errors` array.
    pub fn has_errors(&self) -> bool {
        self.errors.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Turn a response into its data, treating protocol errors as failures.
    pub fn into_data(self) -> Result<Value, TransportError> {
        if let Some(errors) = self.errors.filter(|e| !e.is_empty()) {
            return Err(TransportError::GraphQL { errors });
        }
        self.data
            .ok_or_else(|| TransportError::InvalidResponse("response has no data".to_string()))
    }
}

/// Executes queries and mutations.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(
        &self,
        payload: GraphQLPayload,
        options: FetchOptions,
    ) -> Result<ExecutionResult, TransportError>;
}

/// Opens subscription streams. Dropping the stream unsubscribes.
pub trait Subscriber: Send + Sync {
    fn subscribe(
        &self,
        payload: GraphQLPayload,
    ) -> Result<BoxStream<'static, Result<ExecutionResult, TransportError>>, TransportError>;
}
