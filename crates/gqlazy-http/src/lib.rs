//! gqlazy HTTP - Transport for the gqlazy client
//!
//! Provides [`HttpFetcher`], a [`Fetcher`](gqlazy_core::Fetcher) that posts
//! GraphQL payloads to an endpoint configured through
//! [`TransportConfig`](gqlazy_config::TransportConfig).
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gqlazy_config::ClientConfig;
//! use gqlazy_core::{Client, ClientOptions, Schema};
//! use gqlazy_http::HttpFetcher;
//!
//! let config = ClientConfig::default();
//! let fetcher = HttpFetcher::new(&config.transport)?;
//! let client = Client::new(Schema::new(), Arc::new(fetcher), ClientOptions::from(&config));
//! ```

pub mod fetcher;

pub use fetcher::HttpFetcher;
