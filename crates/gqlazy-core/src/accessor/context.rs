//! Resolution contexts.
//!
//! A context collects the selections touched while application code walks
//! accessors, records how fresh the data it saw was, and memoizes object
//! accessors so unchanged data keeps yielding the same accessor.

use super::{Accessor, AccessorInner, ArrayAccessor, FieldValue, UnionAccessor};
use crate::cache::{Cache, CachePath, CacheRead};
use crate::schema::{Schema, TypeKind, TypeRef};
use crate::selection::{ChildOptions, OperationType, Selection, DEFAULT_ALIAS_LENGTH};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::trace;

/// Called for every selection a context registers, and for every write
/// replayed through an accessor.
pub type SelectHook = Arc<dyn Fn(&Arc<Selection>) + Send + Sync>;

/// Root selections of one client.
///
/// Clones share the trees; they are pruned when the last clone drops.
#[derive(Debug, Clone)]
pub(crate) struct Roots(Arc<RootSet>);

#[derive(Debug)]
struct RootSet {
    query: Arc<Selection>,
    mutation: Arc<Selection>,
    subscription: Arc<Selection>,
}

impl Drop for RootSet {
    fn drop(&mut self) {
        self.query.prune();
        self.mutation.prune();
        self.subscription.prune();
    }
}

impl Roots {
    pub fn new(alias_length: usize) -> Self {
        Self(Arc::new(RootSet {
            query: Selection::root_with_alias_length(OperationType::Query, alias_length),
            mutation: Selection::root_with_alias_length(OperationType::Mutation, alias_length),
            subscription: Selection::root_with_alias_length(
                OperationType::Subscription,
                alias_length,
            ),
        }))
    }

    pub fn get(&self, operation: OperationType) -> &Arc<Selection> {
        match operation {
            OperationType::Query => &self.0.query,
            OperationType::Mutation => &self.0.mutation,
            OperationType::Subscription => &self.0.subscription,
        }
    }
}

/// What the reads of one pass found.
#[derive(Debug, Clone, Copy, Default)]
struct Freshness {
    /// Nothing (or only a placeholder) was cached
    missing: bool,
    /// Data was past its stale window
    expired: bool,
    /// Data was expired but still inside its stale window
    stale: bool,
    /// Mutation or subscription fields were read
    network_only: bool,
}

struct MemoEntry {
    data: Value,
    accessor: Weak<AccessorInner>,
}

#[derive(Default)]
struct ContextState {
    selections: Vec<Arc<Selection>>,
    seen: HashSet<u64>,
    freshness: Freshness,
    memo: HashMap<(u64, String), MemoEntry>,
}

pub(crate) struct ContextInner {
    cache: Arc<Cache>,
    schema: Arc<Schema>,
    roots: Roots,
    identity_fields: Vec<String>,
    state: Mutex<ContextState>,
    hooks: Mutex<Vec<SelectHook>>,
}

/// Registry of touched selections for one or more resolution passes.
#[derive(Clone)]
pub struct ResolutionContext {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for ResolutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ResolutionContext")
            .field("selections", &state.selections.len())
            .field("freshness", &state.freshness)
            .finish()
    }
}

impl ResolutionContext {
    /// Standalone context with its own roots.
    pub fn new(cache: Arc<Cache>, schema: Arc<Schema>) -> Self {
        Self::with_roots(
            cache,
            schema,
            Roots::new(DEFAULT_ALIAS_LENGTH),
            vec!["id".to_string(), "_id".to_string()],
        )
    }

    pub(crate) fn with_roots(
        cache: Arc<Cache>,
        schema: Arc<Schema>,
        roots: Roots,
        identity_fields: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                cache,
                schema,
                roots,
                identity_fields,
                state: Mutex::new(ContextState::default()),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn query(&self) -> Accessor {
        self.root(OperationType::Query)
    }

    pub fn mutation(&self) -> Accessor {
        self.root(OperationType::Mutation)
    }

    pub fn subscription(&self) -> Accessor {
        self.root(OperationType::Subscription)
    }

    /// Accessor over the root type of `operation`.
    pub fn root(&self, operation: OperationType) -> Accessor {
        Accessor::new(AccessorInner {
            context: self.clone(),
            selection: Arc::clone(self.inner.roots.get(operation)),
            type_name: operation.as_str().to_string(),
            operation,
            path: None,
            placeholder: false,
        })
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.inner.cache
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    /// Register a touched selection. Each selection is recorded once per pass.
    pub fn select(&self, selection: &Arc<Selection>) {
        let added = {
            let mut state = self.inner.state.lock();
            if state.seen.insert(selection.id()) {
                state.selections.push(Arc::clone(selection));
                true
            } else {
                false
            }
        };
        if added {
            self.replay(selection);
        }
    }

    /// Run `hook` for every selection registered from now on.
    pub fn on_select<F>(&self, hook: F)
    where
        F: Fn(&Arc<Selection>) + Send + Sync + 'static,
    {
        self.inner.hooks.lock().push(Arc::new(hook));
    }

    /// Selections touched since the last [`reset`](Self::reset).
    pub fn selections(&self) -> Vec<Arc<Selection>> {
        self.inner.state.lock().selections.clone()
    }

    /// Whether a pass touched a subscription field.
    pub fn has_subscriptions(&self) -> bool {
        self.inner
            .state
            .lock()
            .selections
            .iter()
            .any(|s| s.operation() == Some(OperationType::Subscription))
    }

    /// Whether the data read is incomplete, expired or network-only.
    pub fn should_fetch(&self) -> bool {
        let f = self.inner.state.lock().freshness;
        f.missing || f.expired || f.network_only
    }

    /// Whether stale data was served and a background refetch is due.
    pub fn should_revalidate(&self) -> bool {
        self.inner.state.lock().freshness.stale
    }

    /// Whether cached data is absent, ignoring staleness and network-only reads.
    pub(crate) fn is_missing_data(&self) -> bool {
        self.inner.state.lock().freshness.missing
    }

    /// Whether mutation or subscription fields were read.
    pub(crate) fn is_network_only(&self) -> bool {
        self.inner.state.lock().freshness.network_only
    }

    /// Whether data is absent or past its stale window.
    pub(crate) fn needs_data(&self) -> bool {
        let f = self.inner.state.lock().freshness;
        f.missing || f.expired
    }

    /// Start a new pass. Memoized accessors are kept.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.selections.clear();
        state.seen.clear();
        state.freshness = Freshness::default();
        state.memo.retain(|_, entry| entry.accessor.strong_count() > 0);
    }

    pub(crate) fn replay(&self, selection: &Arc<Selection>) {
        let hooks = self.inner.hooks.lock().clone();
        for hook in hooks {
            hook(selection);
        }
    }

    /// Record the freshness of one read.
    fn observe(&self, read: &CacheRead, operation: OperationType) {
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        let freshness = &mut state.freshness;
        if operation != OperationType::Query {
            freshness.network_only = true;
            return;
        }
        if read.value.is_none() || read.skeleton {
            freshness.missing = true;
            return;
        }
        match (read.expires_at, read.swr_before) {
            (Some(expires), _) if now < expires => {}
            (Some(_), Some(swr)) if now < swr => freshness.stale = true,
            (Some(_), _) => freshness.expired = true,
            (None, _) => {}
        }
    }

    /// Register `selection` along with the fields its type selects implicitly.
    pub(crate) fn register(&self, selection: &Arc<Selection>, type_ref: &TypeRef) {
        self.select(selection);
        if type_ref.is_list() {
            return;
        }
        match self.inner.schema.kind(&type_ref.name) {
            TypeKind::Object => self.select_identity(selection, &type_ref.name, true),
            TypeKind::Abstract => {
                self.select(&selection.get_child("__typename", ChildOptions::default()))
            }
            TypeKind::Scalar => {}
        }
    }

    /// Select `__typename` (optionally) and the identity fields of `type_name`.
    pub(crate) fn select_identity(&self, selection: &Arc<Selection>, type_name: &str, with_typename: bool) {
        if with_typename {
            self.select(&selection.get_child("__typename", ChildOptions::default()));
        }
        for field in self
            .inner
            .schema
            .identity_fields(type_name, &self.inner.identity_fields)
        {
            self.select(&selection.get_child(field, ChildOptions::default()));
        }
    }

    /// Resolve the value of a selected field at `path`.
    pub(crate) fn resolve(
        &self,
        selection: Arc<Selection>,
        type_ref: TypeRef,
        path: CachePath,
        operation: OperationType,
        placeholder: bool,
    ) -> FieldValue {
        self.register(&selection, &type_ref);

        if type_ref.is_list() {
            let value = if placeholder {
                None
            } else {
                Some(self.read(&path, operation))
            };
            let live = match value {
                None => false,
                Some(Some(Value::Array(_))) => true,
                Some(Some(_)) => return FieldValue::List(None),
                Some(None) => {
                    self.inner.cache.seed_skeleton(&path, Value::Array(Vec::new()));
                    true
                }
            };
            let array = ArrayAccessor::new(self.clone(), selection, type_ref.item(), operation, path, !live);
            array.touch(0);
            return FieldValue::List(Some(array));
        }

        let kind = self.inner.schema.kind(&type_ref.name);
        if placeholder {
            return match kind {
                TypeKind::Scalar => FieldValue::Scalar(None),
                TypeKind::Object => FieldValue::Object(Some(self.accessor(
                    selection,
                    type_ref.name,
                    path,
                    operation,
                    None,
                ))),
                TypeKind::Abstract => FieldValue::Union(Some(UnionAccessor::new(
                    self.clone(),
                    selection,
                    type_ref.name,
                    operation,
                    path,
                    true,
                ))),
            };
        }

        let value = self.read(&path, operation);
        match kind {
            TypeKind::Scalar => FieldValue::Scalar(value.filter(|v| !v.is_null())),
            TypeKind::Object => match value {
                Some(data @ Value::Object(_)) => FieldValue::Object(Some(self.accessor(
                    selection,
                    type_ref.name,
                    path,
                    operation,
                    Some(&data),
                ))),
                Some(_) => FieldValue::Object(None),
                None => {
                    let skeleton = Value::Object(Map::new());
                    self.inner.cache.seed_skeleton(&path, skeleton.clone());
                    FieldValue::Object(Some(self.accessor(
                        selection,
                        type_ref.name,
                        path,
                        operation,
                        Some(&skeleton),
                    )))
                }
            },
            TypeKind::Abstract => match value {
                Some(Value::Object(_)) => FieldValue::Union(Some(UnionAccessor::new(
                    self.clone(),
                    selection,
                    type_ref.name,
                    operation,
                    path,
                    false,
                ))),
                Some(_) => FieldValue::Union(None),
                None => {
                    self.inner
                        .cache
                        .seed_skeleton(&path, Value::Object(Map::new()));
                    FieldValue::Union(Some(UnionAccessor::new(
                        self.clone(),
                        selection,
                        type_ref.name,
                        operation,
                        path,
                        false,
                    )))
                }
            },
        }
    }

    /// Read the value at `path`, recording its freshness.
    pub(crate) fn read(&self, path: &CachePath, operation: OperationType) -> Option<Value> {
        let read = self.inner.cache.read(path);
        self.observe(&read, operation);
        read.value
    }

    /// Object accessor for `path`, memoized while `data` is unchanged.
    ///
    /// `data` of `None` yields a placeholder that never reads the cache.
    pub(crate) fn accessor(
        &self,
        selection: Arc<Selection>,
        type_name: String,
        path: CachePath,
        operation: OperationType,
        data: Option<&Value>,
    ) -> Accessor {
        let build = |selection, type_name, path| {
            Accessor::new(AccessorInner {
                context: self.clone(),
                selection,
                type_name,
                operation,
                path: Some(path),
                placeholder: data.is_none(),
            })
        };
        let Some(data) = data else {
            return build(selection, type_name, path);
        };

        let key = (selection.id(), path.to_string());
        let mut state = self.inner.state.lock();
        if let Some(entry) = state.memo.get(&key) {
            if entry.data == *data {
                if let Some(inner) = entry.accessor.upgrade() {
                    return Accessor { inner };
                }
            }
        }
        trace!("New accessor for {}", key.1);
        let accessor = build(selection, type_name, path);
        state.memo.insert(
            key,
            MemoEntry {
                data: data.clone(),
                accessor: Arc::downgrade(&accessor.inner),
            },
        );
        accessor
    }

    /// Drop the memoized accessor of `selection` at `path`.
    pub(crate) fn forget(&self, selection: &Selection, path: &CachePath) {
        self.inner
            .state
            .lock()
            .memo
            .remove(&(selection.id(), path.to_string()));
    }
}
