//! HTTP fetcher
//!
//! Posts GraphQL payloads as JSON to a single endpoint.
//!
//! # Endpoint Format
//!
//! - POST `{endpoint}`
//! - Request: `{"query": "...", "variables": {...}, "operationName": "...", "extensions": {...}}`
//! - Response: `{"data": {...}, "errors": [...], "extensions": {...}}`
//!
//! Transient failures (connection errors, timeouts, 429 and 5xx statuses) are
//! retried with exponential backoff. Other statuses fail immediately.

use std::time::Duration;

use async_trait::async_trait;
use gqlazy_config::TransportConfig;
use gqlazy_core::{ExecutionResult, FetchOptions, Fetcher, GraphQLPayload, TransportError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

/// Base delay for exponential backoff (milliseconds)
const RETRY_BASE_DELAY_MS: u64 = 500;

/// Fetcher over HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    endpoint: String,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpFetcher {
    /// Create a fetcher from transport settings.
    ///
    /// Headers are fixed at construction. When `auth_token_env` names a set
    /// variable its value is sent as a bearer token.
    pub fn new(config: &TransportConfig) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::InvalidRequest(format!("header '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidRequest(format!("header '{}': {}", name, e)))?;
            headers.insert(name, value);
        }

        if let Some(var) = &config.auth_token_env {
            match std::env::var(var) {
                Ok(token) => {
                    let value = HeaderValue::from_str(&format!("Bearer {}", token))
                        .map_err(|e| TransportError::InvalidRequest(format!("auth token: {}", e)))?;
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!("Auth token variable {} is not set", var),
            }
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Network(format!("HTTP client error: {}", e)))?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(RETRY_BASE_DELAY_MS),
        })
    }

    /// Set the first retry delay
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send request with retry logic
    async fn request_with_retry(&self, payload: &GraphQLPayload) -> Result<ExecutionResult, TransportError> {
        let mut retry_delay = self.retry_delay;

        for attempt in 0..self.max_retries {
            match self.send_request(payload).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() => {
                    debug!(
                        "Attempt {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        e,
                        retry_delay
                    );
                    tokio::time::sleep(retry_delay).await;
                    retry_delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
        self.send_request(payload).await
    }

    /// Send a single request to the endpoint
    async fn send_request(&self, payload: &GraphQLPayload) -> Result<ExecutionResult, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Network("request timed out".into())
                } else if e.is_connect() {
                    TransportError::Network(format!("connection failed: {}", e))
                } else {
                    TransportError::Network(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ExecutionResult>()
            .await
            .map_err(|e| TransportError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        payload: GraphQLPayload,
        options: FetchOptions,
    ) -> Result<ExecutionResult, TransportError> {
        debug!("POST {} ({} {})", self.endpoint, options.operation, options.hash);
        self.request_with_retry(&payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gqlazy_core::OperationType;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer) -> TransportConfig {
        TransportConfig {
            endpoint: server.uri(),
            max_retries: 1,
            timeout_secs: 5,
            ..Default::default()
        }
    }

    fn options() -> FetchOptions {
        FetchOptions {
            operation: OperationType::Query,
            hash: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header("content-type", "application/json"))
            .and(body_json(json!({"query": "query{hello}"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {"hello": "world"}})))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&test_config(&server)).unwrap();
        let result = fetcher
            .fetch(GraphQLPayload::new("query{hello}"), options())
            .await
            .unwrap();
        assert_eq!(result.data, Some(json!({"hello": "world"})));
    }

    #[tokio::test]
    async fn test_configured_headers_are_sent() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(header("x-client", "gqlazy"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.headers.insert("x-client".into(), "gqlazy".into());
        let fetcher = HttpFetcher::new(&config).unwrap();
        fetcher
            .fetch(GraphQLPayload::new("query{a}"), options())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(2)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&test_config(&server))
            .unwrap()
            .with_retry_delay(Duration::from_millis(10));
        let err = fetcher
            .fetch(GraphQLPayload::new("query{a}"), options())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::Status {
                status: 503,
                body: "busy".into()
            }
        );
    }

    #[tokio::test]
    async fn test_client_errors_fail_immediately() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad query"))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&test_config(&server)).unwrap();
        let err = fetcher
            .fetch(GraphQLPayload::new("query{"), options())
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_malformed_body() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(&test_config(&server)).unwrap();
        let err = fetcher
            .fetch(GraphQLPayload::new("query{a}"), options())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidResponse(_)));
    }

    #[test]
    fn test_invalid_header_name() {
        let mut config = TransportConfig::default();
        config.headers.insert("bad header".into(), "x".into());
        assert!(matches!(
            HttpFetcher::new(&config),
            Err(TransportError::InvalidRequest(_))
        ));
    }
}
