//! Error types for the gqlazy engine.
//!
//! Two families with different delivery channels:
//! - [`ValidationError`] is returned synchronously for usage errors.
//! - [`TransportError`] travels through the async chain (scheduler settlement,
//!   resolve results, subscription streams). It is `Clone` because one failed
//!   fetch is observed by every caller attached to the same group.

use crate::transport::GraphQLError;
use gqlazy_config::ConfigError;
use thiserror::Error;

/// Usage errors raised synchronously by the cache, the accessors and the
/// query builder.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// Cache path without a `root.field` prefix or with an unknown root
    #[error("malformed cache path '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    /// Type not present in the schema
    #[error("unknown type '{0}'")]
    UnknownType(String),

    /// Field not declared on the type
    #[error("unknown field '{field}' on type '{type_name}'")]
    UnknownField { type_name: String, field: String },

    /// Argument not declared on the field
    #[error("unknown argument '{argument}' on field '{field}'")]
    UnknownArgument { field: String, argument: String },

    /// Array write past the end of the array
    #[error("invalid array assignment at index {index} (length {len})")]
    InvalidArrayAssignment { index: usize, len: usize },

    /// Selection whose root is not an operation type
    #[error("selection root '{0}' is not an operation type")]
    InconsistentRoot(String),

    /// Snapshot without any operation root
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    /// Snapshot reference to a normalized object that is not present
    #[error("unresolved reference '{0}' in snapshot")]
    UnresolvedReference(String),

    /// Schema document could not be parsed
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

impl ValidationError {
    /// Create a new MalformedPath error.
    pub fn malformed_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a new UnknownField error.
    pub fn unknown_field(type_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            type_name: type_name.into(),
            field: field.into(),
        }
    }

    /// Create a new UnknownArgument error.
    pub fn unknown_argument(field: impl Into<String>, argument: impl Into<String>) -> Self {
        Self::UnknownArgument {
            field: field.into(),
            argument: argument.into(),
        }
    }
}

/// Failures of a fetch or subscription, normalized into one shape.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransportError {
    /// The server answered with protocol-level errors
    #[error("GraphQL errors: {}", join_messages(.errors))]
    GraphQL { errors: Vec<GraphQLError> },

    /// The request never produced a response
    #[error("network error: {0}")]
    Network(String),

    /// Non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The response body was not a GraphQL execution result
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The request could not be built from the touched selections
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A subscription selection was made without a subscriber
    #[error("no subscriber configured for subscription operations")]
    SubscriberMissing,

    /// The group was dropped before it settled
    #[error("fetch cancelled before completion")]
    Cancelled,
}

impl TransportError {
    /// Whether a retry could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

fn join_messages(errors: &[GraphQLError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors surfaced by the [`Client`](crate::Client) facade.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias for synchronous operations.
pub type Result<T, E = ValidationError> = std::result::Result<T, E>;
