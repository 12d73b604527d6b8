//! gqlazy Core - Lazy GraphQL client engine
//!
//! This crate provides the engine behind the gqlazy client:
//! - Selection trees built on demand as code reads fields
//! - Query compilation with generated aliases and variables
//! - A normalized response cache with TTL and stale-while-revalidate
//! - Typed accessors that select and read in one step
//! - A scheduler that batches and deduplicates fetches

pub mod accessor;
pub mod cache;
pub mod client;
pub mod error;
pub mod hash;
pub mod query;
pub mod scheduler;
pub mod schema;
pub mod selection;
pub mod transport;

// Selection and compilation re-exports
pub use query::{BuildOptions, CompiledDocument, QueryBuilder, DEFAULT_DOCUMENT_CACHE_SIZE};
pub use schema::{FieldDef, Schema, TypeKind, TypeRef};
pub use selection::{
    Argument, ChildOptions, OperationType, Selection, SelectionInput, SelectionKey,
    DEFAULT_ALIAS_LENGTH,
};

// Cache re-exports
pub use cache::{
    Cache, CacheEntry, CacheMetrics, CacheOptions, CachePath, CacheSnapshot, CacheSubscription,
    GetOptions, Normalizer, SetOptions,
};

// Accessor re-exports
pub use accessor::{Accessor, ArrayAccessor, FieldValue, ResolutionContext, UnionAccessor};

// Client re-exports
pub use client::{Client, ClientOptions, FetchPolicy, ResolveOptions};
pub use scheduler::{BatchKey, Scheduler};
pub use transport::{
    ExecutionResult, FetchOptions, Fetcher, GraphQLError, GraphQLPayload, Subscriber,
};

// Error re-exports
pub use error::{ClientError, Result, TransportError, ValidationError};
