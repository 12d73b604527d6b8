//! Client over HTTP integration tests
//!
//! Drives a `Client` backed by `HttpFetcher` against a mock GraphQL server.
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package gqlazy-http --test client_http
//! ```

use std::sync::Arc;

use gqlazy_config::TransportConfig;
use gqlazy_core::{
    Client, ClientError, ClientOptions, FieldDef, GetOptions, ResolveOptions, Schema,
    TransportError,
};
use gqlazy_http::HttpFetcher;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn schema() -> Schema {
    Schema::new()
        .with_type("query", [("viewer", FieldDef::new("User!"))])
        .with_type(
            "User",
            [("id", FieldDef::new("ID!")), ("login", FieldDef::new("String!"))],
        )
}

fn client(server: &MockServer) -> Client {
    let config = TransportConfig {
        endpoint: server.uri(),
        max_retries: 0,
        timeout_secs: 5,
        ..Default::default()
    };
    let fetcher = HttpFetcher::new(&config).expect("fetcher should build");
    Client::new(schema(), Arc::new(fetcher), ClientOptions::default())
}

fn viewer_login(ctx: &gqlazy_core::ResolutionContext) -> gqlazy_core::Result<Option<serde_json::Value>> {
    match ctx.query().object("viewer")? {
        Some(viewer) => viewer.scalar("login"),
        None => Ok(None),
    }
}

#[tokio::test]
async fn test_resolve_over_http() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(body_partial_json(json!({"query": "query{viewer{__typename id login}}"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"viewer": {"__typename": "User", "id": "u1", "login": "ada"}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let login = client
        .resolve(viewer_login, ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(login, Some(json!("ada")));

    // Second read is served from the cache
    let again = client
        .resolve(viewer_login, ResolveOptions::default())
        .await
        .unwrap();
    assert_eq!(again, Some(json!("ada")));
    assert_eq!(client.cache().normalized_len(), 1);
}

#[tokio::test]
async fn test_graphql_errors_over_http() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"viewer": {"__typename": "User", "id": "u1", "login": "ada"}},
            "errors": [{"message": "not allowed"}]
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client
        .resolve(viewer_login, ResolveOptions::default())
        .await
        .unwrap_err();
    match err {
        ClientError::Transport(TransportError::GraphQL { errors }) => {
            assert_eq!(errors[0].message, "not allowed");
        }
        other => panic!("unexpected error: {other}"),
    }

    let login = client
        .cache()
        .get("query.viewer.login", GetOptions::default())
        .unwrap();
    assert_eq!(login.data, None);
}

#[tokio::test]
async fn test_http_status_surfaces_as_transport_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let err = client(&server)
        .resolve(viewer_login, ResolveOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::Status { status: 401, .. })
    ));
}
