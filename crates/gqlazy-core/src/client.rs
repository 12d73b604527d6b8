//! Client facade.
//!
//! Wires the cache, the query builder, the scheduler and the transport
//! together. [`Client::resolve`] runs a closure against the cache, fetches
//! whatever it touched that is missing or stale, and runs it again.

use crate::accessor::{ResolutionContext, Roots};
use crate::cache::{Cache, CacheOptions, CachePath, SetOptions};
use crate::error::{ClientError, TransportError, ValidationError};
use crate::query::{BuildOptions, CompiledDocument, QueryBuilder, DEFAULT_DOCUMENT_CACHE_SIZE};
use crate::scheduler::{BatchKey, FetchCallback, FetchResult, Scheduler};
use crate::schema::Schema;
use crate::selection::{OperationType, Selection, DEFAULT_ALIAS_LENGTH};
use crate::transport::{ExecutionResult, FetchOptions, Fetcher, GraphQLPayload, Subscriber};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use gqlazy_config::ClientConfig;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Client construction options.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub cache: CacheOptions,
    /// Debounce window of the scheduler
    pub scheduler_window: Duration,
    /// Hash characters in generated aliases
    pub alias_length: usize,
    /// Compiled selection sets kept by the query builder
    pub document_cache_size: usize,
    /// Candidate identity fields selected automatically on objects
    pub identity_fields: Vec<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cache: CacheOptions::default(),
            scheduler_window: Duration::ZERO,
            alias_length: DEFAULT_ALIAS_LENGTH,
            document_cache_size: DEFAULT_DOCUMENT_CACHE_SIZE,
            identity_fields: vec!["id".to_string(), "_id".to_string()],
        }
    }
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            cache: CacheOptions::from(&config.cache),
            scheduler_window: Duration::from_millis(config.scheduler.window_ms),
            alias_length: config.selection.alias_length,
            document_cache_size: config.selection.document_cache_size,
            identity_fields: config.cache.identity_fields.clone(),
        }
    }
}

/// How [`Client::resolve`] uses the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Fetch missing or expired data, revalidate stale data in the background
    #[default]
    Default,
    /// Serve any cached data, fetch only what is missing
    ForceCache,
    /// Always fetch, then store
    NoCache,
    /// Always fetch into a scratch cache, leaving the shared one untouched
    NoStore,
    /// Never fetch
    OnlyIfCached,
}

/// Options for [`Client::resolve`] and [`Client::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub fetch_policy: FetchPolicy,
    pub operation_name: Option<String>,
    pub extensions: Option<Map<String, Value>>,
}

impl ResolveOptions {
    fn batch_key(&self) -> BatchKey {
        BatchKey::new(self.operation_name.clone(), self.extensions.as_ref())
    }
}

type InFlight = Shared<BoxFuture<'static, FetchResult>>;

struct ClientInner {
    cache: Arc<Cache>,
    schema: Arc<Schema>,
    fetcher: Arc<dyn Fetcher>,
    subscriber: Option<Arc<dyn Subscriber>>,
    roots: Roots,
    identity_fields: Vec<String>,
    builder: QueryBuilder,
    scheduler: Scheduler,

    /// Requests by content hash, tagged with the generation that created them
    in_flight: Arc<DashMap<String, (u64, InFlight)>>,
    generation: AtomicU64,
}

/// Lazy GraphQL client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("cache", &self.inner.cache)
            .field("scheduler", &self.inner.scheduler)
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

impl Client {
    pub fn new(schema: Schema, fetcher: Arc<dyn Fetcher>, options: ClientOptions) -> Self {
        Self::build(schema, fetcher, None, options)
    }

    /// Client that routes subscription operations to `subscriber`.
    pub fn with_subscriber(
        schema: Schema,
        fetcher: Arc<dyn Fetcher>,
        subscriber: Arc<dyn Subscriber>,
        options: ClientOptions,
    ) -> Self {
        Self::build(schema, fetcher, Some(subscriber), options)
    }

    fn build(
        schema: Schema,
        fetcher: Arc<dyn Fetcher>,
        subscriber: Option<Arc<dyn Subscriber>>,
        options: ClientOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ClientInner>| {
            let weak = weak.clone();
            let fetch: FetchCallback = Arc::new(move |selections: Vec<Arc<Selection>>, key: BatchKey| {
                let weak = weak.clone();
                async move {
                    let inner = weak.upgrade().ok_or(TransportError::Cancelled)?;
                    let cache = Arc::clone(&inner.cache);
                    inner.fetch_group(selections, key, cache, true).await
                }
                .boxed()
            });

            ClientInner {
                cache: Arc::new(Cache::new(options.cache)),
                schema: Arc::new(schema),
                fetcher,
                subscriber,
                roots: Roots::new(options.alias_length),
                identity_fields: options.identity_fields,
                builder: QueryBuilder::new(options.document_cache_size),
                scheduler: Scheduler::new(options.scheduler_window, fetch),
                in_flight: Arc::new(DashMap::new()),
                generation: AtomicU64::new(0),
            }
        });
        Self { inner }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.inner.cache
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    pub fn builder(&self) -> &QueryBuilder {
        &self.inner.builder
    }

    /// Root selection of `operation`, shared by every context of this client.
    pub fn root(&self, operation: OperationType) -> &Arc<Selection> {
        self.inner.roots.get(operation)
    }

    /// Long-lived resolution context over the shared cache.
    pub fn context(&self) -> ResolutionContext {
        self.inner.context_for(Arc::clone(&self.inner.cache))
    }

    /// Number of requests currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Run `f` against the cache, fetch what it touched if needed, run it again.
    pub async fn resolve<T, F>(&self, f: F, options: ResolveOptions) -> Result<T, ClientError>
    where
        F: Fn(&ResolutionContext) -> Result<T, ValidationError>,
    {
        let inner = &self.inner;
        let scratch = (options.fetch_policy == FetchPolicy::NoStore)
            .then(|| Arc::new(Cache::new(inner.cache.options().clone())));
        let cache = scratch.clone().unwrap_or_else(|| Arc::clone(&inner.cache));
        let context = inner.context_for(cache);

        let value = f(&context)?;
        if context.has_subscriptions() && inner.subscriber.is_none() {
            return Err(TransportError::SubscriberMissing.into());
        }

        let selections = context.selections();
        let fetch = match options.fetch_policy {
            FetchPolicy::Default => context.should_fetch(),
            FetchPolicy::ForceCache => context.is_missing_data() || context.is_network_only(),
            FetchPolicy::NoCache | FetchPolicy::NoStore => !selections.is_empty(),
            FetchPolicy::OnlyIfCached => false,
        };
        if !fetch {
            if options.fetch_policy == FetchPolicy::Default && context.should_revalidate() {
                self.revalidate(selections, options.batch_key());
            }
            return Ok(value);
        }
        drop(value);

        match scratch {
            Some(scratch) => {
                Arc::clone(inner)
                    .fetch_group(selections, options.batch_key(), scratch, false)
                    .await?
            }
            None => inner.scheduler.add(selections, options.batch_key()).await?,
        }

        context.reset();
        Ok(f(&context)?)
    }

    /// Schedule `selections` for fetching into the shared cache.
    pub async fn fetch(&self, selections: Vec<Arc<Selection>>, options: &ResolveOptions) -> Result<(), TransportError> {
        self.inner.scheduler.add(selections, options.batch_key()).await
    }

    fn revalidate(&self, selections: Vec<Arc<Selection>>, key: BatchKey) {
        debug!("Revalidating {} stale selections", selections.len());
        let pending = self.inner.scheduler.add(selections, key);
        tokio::spawn(async move {
            if let Err(e) = pending.await {
                debug!("Background revalidation failed: {}", e);
            }
        });
    }

    /// Stream of `f` results, re-evaluated whenever the data it read changes.
    ///
    /// Subscription fields touched by `f` are fed from the subscriber; query
    /// fields are fetched when missing. Transport failures are delivered as
    /// items without ending the stream. Dropping the stream stops everything.
    pub fn subscribe<T, F>(&self, f: F, options: ResolveOptions) -> BoxStream<'static, Result<T, ClientError>>
    where
        F: Fn(&ResolutionContext) -> Result<T, ValidationError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.clone();
        tokio::spawn(async move { client.watch(f, options, tx).await });
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }

    async fn watch<T, F>(self, f: F, options: ResolveOptions, tx: mpsc::UnboundedSender<Result<T, ClientError>>)
    where
        F: Fn(&ResolutionContext) -> Result<T, ValidationError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let inner = &self.inner;
        let key = options.batch_key();
        let context = self.context();

        let mut result = f(&context);
        let queries = query_selections(&context);
        if context.needs_data() && !queries.is_empty() {
            if let Err(e) = inner.scheduler.add(queries, key.clone()).await {
                let _ = tx.send(Err(e.into()));
            }
            context.reset();
            result = f(&context);
        }

        let mut feeds = Vec::new();
        let subscriptions: Vec<Arc<Selection>> = context
            .selections()
            .into_iter()
            .filter(|s| s.operation() == Some(OperationType::Subscription))
            .collect();
        let (changed_tx, mut changed_rx) = mpsc::unbounded_channel::<()>();
        let mut watched = watched_paths(&context.selections());
        let notify = changed_tx.clone();
        let mut _watch = inner.cache.subscribe_paths(watched.clone(), move |_| {
            let _ = notify.send(());
        });

        if !subscriptions.is_empty() {
            let Some(subscriber) = inner.subscriber.clone() else {
                let _ = tx.send(Err(TransportError::SubscriberMissing.into()));
                return;
            };
            let build = BuildOptions {
                operation_name: options.operation_name.clone(),
            };
            let documents = match inner.builder.build(&subscriptions, &build) {
                Ok(documents) => documents,
                Err(e) => {
                    let _ = tx.send(Err(e.into()));
                    return;
                }
            };
            for document in documents {
                let payload = payload(document, options.extensions.clone());
                match subscriber.subscribe(payload) {
                    Ok(events) => feeds.push(AbortOnDrop(tokio::spawn(feed(
                        events,
                        Arc::clone(&inner.cache),
                        tx.clone(),
                    )))),
                    Err(e) => {
                        let _ = tx.send(Err(e.into()));
                        return;
                    }
                }
            }
        } else if tx.send(result.map_err(ClientError::from)).is_err() {
            return;
        }

        let mut last_fetch: Option<Vec<u64>> = None;
        loop {
            tokio::select! {
                _ = tx.closed() => break,
                changed = changed_rx.recv() => {
                    if changed.is_none() {
                        break;
                    }
                }
            }
            while changed_rx.try_recv().is_ok() {}

            context.reset();
            let result = f(&context);

            let paths = watched_paths(&context.selections());
            if paths != watched {
                let notify = changed_tx.clone();
                _watch = inner.cache.subscribe_paths(paths.clone(), move |_| {
                    let _ = notify.send(());
                });
                watched = paths;
            }

            let queries = query_selections(&context);
            if context.needs_data() && !queries.is_empty() {
                let ids: Vec<u64> = queries.iter().map(|s| s.id()).collect();
                if last_fetch.as_ref() != Some(&ids) {
                    last_fetch = Some(ids);
                    let pending = inner.scheduler.add(queries, key.clone());
                    let errors = tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = pending.await {
                            let _ = errors.send(Err(e.into()));
                        }
                    });
                }
            }

            if tx.send(result.map_err(ClientError::from)).is_err() {
                break;
            }
        }
        debug!("Watch ended with {} subscription feeds", feeds.len());
    }
}

impl ClientInner {
    fn context_for(&self, cache: Arc<Cache>) -> ResolutionContext {
        ResolutionContext::with_roots(
            cache,
            Arc::clone(&self.schema),
            self.roots.clone(),
            self.identity_fields.clone(),
        )
    }

    /// Compile `selections` and fetch every resulting document into `cache`.
    async fn fetch_group(
        self: Arc<Self>,
        selections: Vec<Arc<Selection>>,
        key: BatchKey,
        cache: Arc<Cache>,
        dedupe: bool,
    ) -> FetchResult {
        let options = BuildOptions {
            operation_name: key.operation_name.clone(),
        };
        let documents = self
            .builder
            .build(&selections, &options)
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        let extensions = key.extensions();
        let requests = documents
            .into_iter()
            .map(|document| self.fetch_document(document, extensions.clone(), Arc::clone(&cache), dedupe));
        futures::future::try_join_all(requests).await?;
        Ok(())
    }

    /// Fetch one document, sharing the request with identical ones in flight.
    fn fetch_document(
        &self,
        document: CompiledDocument,
        extensions: Option<Map<String, Value>>,
        cache: Arc<Cache>,
        dedupe: bool,
    ) -> BoxFuture<'static, FetchResult> {
        let key = match &extensions {
            Some(ext) => format!("{}|{}", document.hash, Value::Object(ext.clone())),
            None => document.hash.clone(),
        };
        let options = FetchOptions {
            operation: document.operation,
            hash: document.hash.clone(),
        };
        let request = execute(
            Arc::clone(&self.fetcher),
            self.subscriber.clone(),
            cache,
            payload(document, extensions),
            options,
        )
        .boxed();
        if !dedupe {
            return request;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (generation, shared) = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                debug!("Joining in-flight request {}", short(&key));
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let shared = request.shared();
                entry.insert((generation, shared.clone()));
                (generation, shared)
            }
        };
        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            key,
            generation,
        };
        async move {
            let _guard = guard;
            shared.await
        }
        .boxed()
    }
}

/// Removes an in-flight entry once its request is done or abandoned.
struct InFlightGuard {
    in_flight: Arc<DashMap<String, (u64, InFlight)>>,
    key: String,
    generation: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .remove_if(&self.key, |_, (generation, _)| *generation == self.generation);
    }
}

/// Aborts a spawned task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn payload(document: CompiledDocument, extensions: Option<Map<String, Value>>) -> GraphQLPayload {
    GraphQLPayload {
        query: document.query,
        variables: document.variables,
        operation_name: document.operation_name,
        extensions,
    }
}

async fn execute(
    fetcher: Arc<dyn Fetcher>,
    subscriber: Option<Arc<dyn Subscriber>>,
    cache: Arc<Cache>,
    payload: GraphQLPayload,
    options: FetchOptions,
) -> FetchResult {
    let operation = options.operation;
    info!("Fetching {} {}", operation, short(&options.hash));

    let result = match operation {
        OperationType::Subscription => {
            let subscriber = subscriber.ok_or(TransportError::SubscriberMissing)?;
            let mut events = subscriber.subscribe(payload)?;
            events.next().await.ok_or_else(|| {
                TransportError::InvalidResponse("subscription ended before its first result".to_string())
            })??
        }
        _ => fetcher.fetch(payload, options).await?,
    };
    write_result(&cache, operation, result)
}

/// Write a successful result under its operation root. Failed results are
/// rejected without touching the cache.
fn write_result(cache: &Cache, operation: OperationType, result: ExecutionResult) -> FetchResult {
    let data = result.into_data()?;
    if !data.is_object() {
        return Err(TransportError::InvalidResponse(format!(
            "data must be an object, got {}",
            data
        )));
    }
    let mut roots = Map::new();
    roots.insert(operation.to_string(), data);
    cache
        .set(&Value::Object(roots), SetOptions::default())
        .map_err(|e| TransportError::InvalidResponse(e.to_string()))
}

/// Write every subscription event into the cache until the stream ends.
async fn feed<T>(
    mut events: BoxStream<'static, Result<ExecutionResult, TransportError>>,
    cache: Arc<Cache>,
    tx: mpsc::UnboundedSender<Result<T, ClientError>>,
) {
    while let Some(event) = events.next().await {
        let outcome = event.and_then(|result| write_result(&cache, OperationType::Subscription, result));
        if let Err(e) = outcome {
            warn!("Subscription event rejected: {}", e);
            if tx.send(Err(e.into())).is_err() {
                break;
            }
        }
    }
    debug!("Subscription stream ended");
}

fn query_selections(context: &ResolutionContext) -> Vec<Arc<Selection>> {
    context
        .selections()
        .into_iter()
        .filter(|s| s.operation() == Some(OperationType::Query))
        .collect()
}

/// `root.field` paths covering every selection.
fn watched_paths(selections: &[Arc<Selection>]) -> Vec<CachePath> {
    let mut paths: Vec<CachePath> = selections
        .iter()
        .filter_map(|s| {
            let keys = s.cache_keys();
            let root = keys.first()?.parse::<OperationType>().ok()?;
            Some(CachePath::new(root, keys.get(1)?.clone()))
        })
        .collect();
    paths.sort_by_key(|p| p.to_string());
    paths.dedup();
    paths
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    /// Fetcher answering every request with a fixed response.
    struct StaticFetcher {
        response: Mutex<ExecutionResult>,
        calls: AtomicUsize,
        queries: Mutex<Vec<String>>,
    }

    impl StaticFetcher {
        fn new(response: ExecutionResult) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(response),
                calls: AtomicUsize::new(0),
                queries: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, payload: GraphQLPayload, _: FetchOptions) -> Result<ExecutionResult, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().push(payload.query);
            tokio::task::yield_now().await;
            Ok(self.response.lock().clone())
        }
    }

    fn schema() -> Schema {
        Schema::new()
            .with_type(
                "query",
                [
                    ("hello", FieldDef::new("String!")),
                    ("me", FieldDef::new("User")),
                ],
            )
            .with_type(
                "User",
                [("id", FieldDef::new("ID!")), ("name", FieldDef::new("String"))],
            )
            .with_type("subscription", [("tick", FieldDef::new("Int!"))])
    }

    fn hello(ctx: &ResolutionContext) -> Result<Option<Value>, ValidationError> {
        ctx.query().scalar("hello")
    }

    #[tokio::test]
    async fn test_resolve_fetches_missing_data() {
        let fetcher = StaticFetcher::new(ExecutionResult::data(json!({"hello": "world"})));
        let client = Client::new(schema(), fetcher.clone(), ClientOptions::default());

        let value = client.resolve(hello, ResolveOptions::default()).await.unwrap();
        assert_eq!(value, Some(json!("world")));
        assert_eq!(fetcher.queries.lock().clone(), vec!["query{hello}".to_string()]);

        // Served from the cache the second time
        client.resolve(hello, ResolveOptions::default()).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(client.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_graphql_errors_leave_cache_untouched() {
        let fetcher = StaticFetcher::new(ExecutionResult {
            data: Some(json!({"hello": "partial"})),
            errors: Some(vec![crate::transport::GraphQLError::new("denied")]),
            extensions: None,
        });
        let client = Client::new(schema(), fetcher.clone(), ClientOptions::default());

        let err = client.resolve(hello, ResolveOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::GraphQL { .. })
        ));
        let entry = client
            .cache()
            .get("query.hello", crate::cache::GetOptions::default())
            .unwrap();
        assert_eq!(entry.data, None);
        assert_eq!(client.in_flight_count(), 0);

        // The failed document does not block the next attempt
        *fetcher.response.lock() = ExecutionResult::data(json!({"hello": "world"}));
        let value = client.resolve(hello, ResolveOptions::default()).await.unwrap();
        assert_eq!(value, Some(json!("world")));
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(client.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_passes_reuse_selections() {
        let fetcher = StaticFetcher::new(ExecutionResult::data(json!({"hello": "world"})));
        let client = Client::new(schema(), fetcher, ClientOptions::default());

        let touched = |ctx: &ResolutionContext| {
            hello(ctx).unwrap();
            ctx.selections()
                .iter()
                .find(|s| s.alias_or_key() == "hello")
                .map(|s| s.id())
        };
        let first = touched(&client.context());
        let second = touched(&client.context());
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_only_if_cached_never_fetches() {
        let fetcher = StaticFetcher::new(ExecutionResult::data(json!({"hello": "world"})));
        let client = Client::new(schema(), fetcher.clone(), ClientOptions::default());
        let options = ResolveOptions {
            fetch_policy: FetchPolicy::OnlyIfCached,
            ..Default::default()
        };
        assert_eq!(client.resolve(hello, options).await.unwrap(), None);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_store_uses_scratch_cache() {
        let fetcher = StaticFetcher::new(ExecutionResult::data(json!({"hello": "world"})));
        let client = Client::new(schema(), fetcher.clone(), ClientOptions::default());
        let options = ResolveOptions {
            fetch_policy: FetchPolicy::NoStore,
            ..Default::default()
        };
        assert_eq!(
            client.resolve(hello, options).await.unwrap(),
            Some(json!("world"))
        );
        assert!(client.cache().is_empty());
    }

    #[tokio::test]
    async fn test_no_cache_always_fetches() {
        let fetcher = StaticFetcher::new(ExecutionResult::data(json!({"hello": "world"})));
        let client = Client::new(schema(), fetcher.clone(), ClientOptions::default());
        let options = ResolveOptions {
            fetch_policy: FetchPolicy::NoCache,
            ..Default::default()
        };
        client.resolve(hello, options.clone()).await.unwrap();
        client.resolve(hello, options).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_subscription_without_subscriber_fails_fast() {
        let fetcher = StaticFetcher::new(ExecutionResult::default());
        let client = Client::new(schema(), fetcher.clone(), ClientOptions::default());
        let err = client
            .resolve(|ctx| ctx.subscription().scalar("tick"), ResolveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClientError::Transport(TransportError::SubscriberMissing)
        ));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_request() {
        let fetcher = StaticFetcher::new(ExecutionResult::data(json!({"hello": "world"})));
        let client = Client::new(schema(), fetcher.clone(), ClientOptions::default());

        let (a, b) = tokio::join!(
            client.resolve(hello, ResolveOptions::default()),
            client.resolve(hello, ResolveOptions::default())
        );
        assert_eq!(a.unwrap(), Some(json!("world")));
        assert_eq!(b.unwrap(), Some(json!("world")));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_data_revalidates_in_background() {
        let fetcher = StaticFetcher::new(ExecutionResult::data(json!({"hello": "world"})));
        let options = ClientOptions {
            cache: CacheOptions {
                max_age: Some(Duration::from_millis(10)),
                stale_while_revalidate: Duration::from_millis(100),
                ..Default::default()
            },
            ..Default::default()
        };
        let client = Client::new(schema(), fetcher.clone(), options);
        client.resolve(hello, ResolveOptions::default()).await.unwrap();

        tokio::time::advance(Duration::from_millis(15)).await;
        *fetcher.response.lock() = ExecutionResult::data(json!({"hello": "again"}));
        let stale = client.resolve(hello, ResolveOptions::default()).await.unwrap();
        assert_eq!(stale, Some(json!("world")));

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(fetcher.calls(), 2);
        let fresh = client.resolve(hello, ResolveOptions::default()).await.unwrap();
        assert_eq!(fresh, Some(json!("again")));
    }

    #[tokio::test]
    async fn test_watch_reemits_on_cache_writes() {
        let fetcher = StaticFetcher::new(ExecutionResult::data(json!({"hello": "world"})));
        let client = Client::new(schema(), fetcher.clone(), ClientOptions::default());
        let mut values = client.subscribe(hello, ResolveOptions::default());

        assert_eq!(values.next().await.unwrap().unwrap(), Some(json!("world")));
        client
            .cache()
            .set(&json!({"query": {"hello": "changed"}}), SetOptions::default())
            .unwrap();
        assert_eq!(values.next().await.unwrap().unwrap(), Some(json!("changed")));
        assert_eq!(fetcher.calls(), 1);
    }

    /// Subscriber fed by the test through a channel.
    struct ChannelSubscriber {
        events: Mutex<Option<mpsc::UnboundedReceiver<Result<ExecutionResult, TransportError>>>>,
    }

    impl Subscriber for ChannelSubscriber {
        fn subscribe(
            &self,
            _: GraphQLPayload,
        ) -> Result<BoxStream<'static, Result<ExecutionResult, TransportError>>, TransportError> {
            let rx = self.events.lock().take().ok_or(TransportError::Cancelled)?;
            Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|e| (e, rx)) }).boxed())
        }
    }

    #[tokio::test]
    async fn test_subscription_events_flow_through_cache() {
        let (events, rx) = mpsc::unbounded_channel();
        let subscriber = Arc::new(ChannelSubscriber {
            events: Mutex::new(Some(rx)),
        });
        let fetcher = StaticFetcher::new(ExecutionResult::default());
        let client = Client::with_subscriber(schema(), fetcher.clone(), subscriber, ClientOptions::default());
        let mut ticks = client.subscribe(
            |ctx| ctx.subscription().scalar("tick"),
            ResolveOptions::default(),
        );

        events.send(Ok(ExecutionResult::data(json!({"tick": 1})))).unwrap();
        assert_eq!(ticks.next().await.unwrap().unwrap(), Some(json!(1)));

        events
            .send(Err(TransportError::Network("reset".to_string())))
            .unwrap();
        assert!(matches!(
            ticks.next().await.unwrap(),
            Err(ClientError::Transport(TransportError::Network(_)))
        ));

        events.send(Ok(ExecutionResult::data(json!({"tick": 2})))).unwrap();
        assert_eq!(ticks.next().await.unwrap().unwrap(), Some(json!(2)));
        assert_eq!(fetcher.calls(), 0);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = ClientConfig::default();
        config.scheduler.window_ms = 5;
        config.selection.alias_length = 8;
        let options = ClientOptions::from(&config);
        assert_eq!(options.scheduler_window, Duration::from_millis(5));
        assert_eq!(options.alias_length, 8);
        assert!(options.cache.max_age.is_none());
    }

    #[test]
    fn test_watched_paths_cover_root_fields() {
        let root = Selection::root(OperationType::Query);
        let name = root
            .get_child("me", Default::default())
            .get_child("name", Default::default());
        let hello = root.get_child("hello", Default::default());
        let paths: Vec<String> = watched_paths(&[name, hello, Arc::clone(&root)])
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(paths, vec!["query.hello", "query.me"]);
    }
}
