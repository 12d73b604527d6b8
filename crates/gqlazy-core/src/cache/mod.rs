//! Normalized response cache.
//!
//! Stores one [`CacheDataContainer`] per `(root, field)` slot, with optional
//! identity-based normalization, TTL / stale-while-revalidate bookkeeping,
//! path- and identity-based subscriptions and a cycle-safe snapshot format.
//!
//! Thread-safe: all methods take `&self`. State lives behind a
//! `parking_lot::Mutex` held only for synchronous sections; listeners run
//! after it is released, so they may re-enter the cache.

mod container;
mod normalize;
mod path;
mod snapshot;
mod subscriptions;

pub use container::{CacheDataContainer, CacheMetrics, Retention, OPERATION_RESULT_TTL};
pub use normalize::{
    ref_id, reference, ArrayMergePolicy, IdentityFn, MergeResolver, Normalizer,
    MAX_NORMALIZATION_DEPTH, REF_KEY,
};
pub use path::CachePath;
pub use snapshot::{CacheSnapshot, SNAPSHOT_VERSION};
pub use subscriptions::{CacheListener, CacheSubscription};

use crate::error::ValidationError;
use crate::selection::OperationType;
use container::ContainerKey;
use gqlazy_config::CacheConfig;
use lru::LruCache;
use normalize::{collect_reachable, denormalize, Touched};
use parking_lot::Mutex;
use path::{step, step_mut, walk};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use subscriptions::{Registry, WriteEvent};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Default stale-while-revalidate window (5 minutes)
const DEFAULT_STALE_WHILE_REVALIDATE: Duration = Duration::from_secs(5 * 60);

/// Default container cap
const DEFAULT_MAX_ENTRIES: usize = 4096;

/// Cache construction options.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Freshness of query results (`None` = never expire, retained strongly)
    pub max_age: Option<Duration>,
    pub stale_while_revalidate: Duration,
    /// Containers kept before least-recently-used weak ones are evicted
    pub max_entries: usize,
    /// `None` disables normalization
    pub normalization: Option<Normalizer>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_age: None,
            stale_while_revalidate: DEFAULT_STALE_WHILE_REVALIDATE,
            max_entries: DEFAULT_MAX_ENTRIES,
            normalization: Some(Normalizer::default()),
        }
    }
}

impl From<&CacheConfig> for CacheOptions {
    fn from(config: &CacheConfig) -> Self {
        let max_age = if config.immutable || config.max_age_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(config.max_age_ms))
        };
        let normalization = config.normalization.then(|| {
            Normalizer::with_identity_fields(config.identity_fields.clone())
                .array_merge(config.array_merge.into())
        });
        Self {
            max_age,
            stale_while_revalidate: Duration::from_millis(config.stale_while_revalidate_ms),
            max_entries: config.max_entries.max(1),
            normalization,
        }
    }
}

/// Options for [`Cache::get`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    /// Return data past `expires_at`
    pub include_expired: bool,
}

/// Options for [`Cache::set`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    /// Write without notifying subscribers
    pub skip_notify: bool,
}

/// Result of [`Cache::get`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheEntry {
    /// Denormalized data; `None` when missing or expired
    pub data: Option<Value>,
    pub expires_at: Option<Instant>,
    pub swr_before: Option<Instant>,
}

/// Shallow read used by the accessors.
#[derive(Debug, Clone, Default)]
pub(crate) struct CacheRead {
    /// Value at the path with a final reference resolved one level
    pub value: Option<Value>,
    pub expires_at: Option<Instant>,
    pub swr_before: Option<Instant>,
    /// The value is a placeholder seeded before any data arrived
    pub skeleton: bool,
}

/// Owner of a stored value: a root container or a normalized object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Owner {
    Container(ContainerKey),
    Object(String),
}

/// A position inside an owner's value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Slot {
    owner: Owner,
    path: Vec<String>,
}

impl Slot {
    fn contains(&self, other: &Slot) -> bool {
        self.owner == other.owner && other.path.starts_with(&self.path)
    }
}

struct CacheState {
    /// Root containers; most recently used at the front
    containers: LruCache<ContainerKey, CacheDataContainer>,

    /// Normalized objects keyed by identity
    normalized: HashMap<String, Value>,

    /// Positions holding placeholders rather than data
    skeletons: HashSet<Slot>,

    metrics: CacheMetrics,
}

impl CacheState {
    fn new() -> Self {
        Self {
            // Eviction is managed manually so strong entries survive the cap
            containers: LruCache::unbounded(),
            normalized: HashMap::new(),
            skeletons: HashSet::new(),
            metrics: CacheMetrics::default(),
        }
    }

    fn owner_value(&self, owner: &Owner) -> Option<&Value> {
        match owner {
            Owner::Container(key) => self.containers.peek(key).map(|c| &c.data),
            Owner::Object(id) => self.normalized.get(id),
        }
    }

    fn owner_value_mut(&mut self, owner: &Owner) -> Option<&mut Value> {
        match owner {
            Owner::Container(key) => self.containers.peek_mut(key).map(|c| &mut c.data),
            Owner::Object(id) => self.normalized.get_mut(id),
        }
    }

    fn deref<'a>(&'a self, value: &'a Value) -> Option<&'a Value> {
        match ref_id(value) {
            Some(id) => self.normalized.get(id),
            None => Some(value),
        }
    }

    /// Slot for `path`: intermediate references are followed, a final one is
    /// not. The last segment need not exist yet.
    fn slot_of(&self, path: &CachePath) -> Option<Slot> {
        let key = ContainerKey::new(path.root, path.field.clone());
        let mut current = &self.containers.peek(&key)?.data;
        let mut owner = Owner::Container(key);
        let mut rel = Vec::with_capacity(path.rest.len());

        for (i, segment) in path.rest.iter().enumerate() {
            if let Some(id) = ref_id(current) {
                current = self.normalized.get(id)?;
                owner = Owner::Object(id.to_string());
                rel.clear();
            }
            rel.push(segment.clone());
            if i + 1 < path.rest.len() {
                current = step(current, segment)?;
            }
        }
        Some(Slot { owner, path: rel })
    }

    fn slot_value(&self, slot: &Slot) -> Option<&Value> {
        walk(self.owner_value(&slot.owner)?, slot.path.iter().map(String::as_str))
    }

    /// Normalized ids `path` passes through plus those its value reaches.
    ///
    /// Ids crossed on the way count even when the path ends on a scalar or
    /// does not exist yet.
    fn reach(&self, path: &CachePath, out: &mut HashSet<String>) {
        let key = ContainerKey::new(path.root, path.field.clone());
        let Some(container) = self.containers.peek(&key) else {
            return;
        };
        let mut current = &container.data;
        for segment in &path.rest {
            if let Some(id) = ref_id(current) {
                out.insert(id.to_string());
                match self.normalized.get(id) {
                    Some(object) => current = object,
                    None => return,
                }
            }
            match step(current, segment) {
                Some(next) => current = next,
                None => return,
            }
        }
        collect_reachable(current, &self.normalized, out);
    }

    /// Stored value at `path` with the final reference left in place.
    fn raw_at(&self, path: &CachePath) -> Option<&Value> {
        let slot = self.slot_of(path)?;
        self.slot_value(&slot)
    }

    /// Replace the value at `slot`. Fails when the parent is missing.
    fn write_slot(&mut self, slot: &Slot, value: Value) -> bool {
        let Some(root) = self.owner_value_mut(&slot.owner) else {
            return false;
        };
        let Some((last, parents)) = slot.path.split_last() else {
            *root = value;
            return true;
        };
        let mut current = root;
        for segment in parents {
            current = match step_mut(current, segment) {
                Some(next) => next,
                None => return false,
            };
        }
        match current {
            Value::Object(map) => {
                map.insert(last.clone(), value);
                true
            }
            Value::Array(items) => match last.parse::<usize>() {
                Ok(i) if i < items.len() => {
                    items[i] = value;
                    true
                }
                Ok(i) if i == items.len() => {
                    items.push(value);
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn drop_container_skeletons(&mut self, key: &ContainerKey) {
        self.skeletons
            .retain(|s| !matches!(&s.owner, Owner::Container(k) if k == key));
    }

    /// Forget placeholders that incoming data for normalized objects replaced.
    fn drop_object_skeletons(&mut self, touched: &Touched) {
        if touched.is_empty() {
            return;
        }
        self.skeletons.retain(|s| match &s.owner {
            Owner::Object(id) => match (touched.get(id), s.path.first()) {
                (Some(keys), Some(first)) => !keys.contains(first),
                _ => true,
            },
            Owner::Container(_) => true,
        });
    }

    /// Remove containers past their stale window, then unreachable objects.
    fn sweep(&mut self, now: Instant) -> usize {
        let reclaimable: Vec<ContainerKey> = self
            .containers
            .iter()
            .filter(|(_, c)| c.is_reclaimable(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &reclaimable {
            self.containers.pop(key);
            self.drop_container_skeletons(key);
        }
        self.metrics.evictions += reclaimable.len() as u64;
        self.collect_garbage();
        reclaimable.len()
    }

    /// Evict least-recently-used weak containers above `max_entries`.
    fn enforce_capacity(&mut self, max_entries: usize) {
        while self.containers.len() > max_entries {
            // iter() yields most recent first, so rev() finds the LRU candidate
            let victim = self
                .containers
                .iter()
                .rev()
                .find(|(_, c)| c.retention == Retention::Weak)
                .map(|(k, _)| k.clone());
            let Some(key) = victim else {
                break;
            };
            trace!("Evicting {}.{}", key.root, key.field);
            self.containers.pop(&key);
            self.drop_container_skeletons(&key);
            self.metrics.evictions += 1;
        }
    }

    /// Mark-and-sweep of normalized objects no container reaches.
    fn collect_garbage(&mut self) {
        if self.normalized.is_empty() {
            return;
        }
        let mut reachable = HashSet::new();
        for (_, container) in self.containers.iter() {
            collect_reachable(&container.data, &self.normalized, &mut reachable);
        }
        let before = self.normalized.len();
        self.normalized.retain(|id, _| reachable.contains(id));
        let collected = before - self.normalized.len();
        if collected > 0 {
            debug!("Collected {} unreachable normalized objects", collected);
            self.metrics.collected_objects += collected as u64;
            let normalized = &self.normalized;
            self.skeletons.retain(|s| match &s.owner {
                Owner::Object(id) => normalized.contains_key(id),
                Owner::Container(_) => true,
            });
        }
    }

    /// Copy of an owner's value without placeholders, `None` if it is one.
    fn stripped(&self, owner: &Owner) -> Option<Value> {
        let mut value = self.owner_value(owner)?.clone();
        for skeleton in self.skeletons.iter().filter(|s| &s.owner == owner) {
            if skeleton.path.is_empty() {
                return None;
            }
            snapshot::remove_at(&mut value, &skeleton.path);
        }
        Some(value)
    }
}

/// Normalized, subscribable response cache.
pub struct Cache {
    options: CacheOptions,
    state: Mutex<CacheState>,
    subscriptions: Arc<Mutex<Registry>>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(CacheOptions::default())
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("options", &self.options)
            .field("containers", &self.len())
            .finish()
    }
}

impl Cache {
    pub fn new(options: CacheOptions) -> Self {
        Self {
            options,
            state: Mutex::new(CacheState::new()),
            subscriptions: Arc::new(Mutex::new(Registry::default())),
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Number of root containers.
    pub fn len(&self) -> usize {
        self.state.lock().containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of normalized objects.
    pub fn normalized_len(&self) -> usize {
        self.state.lock().normalized.len()
    }

    /// Get a snapshot of cache metrics
    pub fn metrics(&self) -> CacheMetrics {
        self.state.lock().metrics.clone()
    }

    /// Read `root.field[.subpath]`, resolving normalized references.
    pub fn get(&self, path: &str, options: GetOptions) -> Result<CacheEntry, ValidationError> {
        let path = CachePath::parse(path)?;
        Ok(self.get_path(&path, options))
    }

    pub fn get_path(&self, path: &CachePath, options: GetOptions) -> CacheEntry {
        let now = Instant::now();
        let mut state = self.state.lock();
        let key = ContainerKey::new(path.root, path.field.clone());

        let Some(container) = state.containers.get(&key) else {
            state.metrics.record(false);
            return CacheEntry::default();
        };
        let mut entry = CacheEntry {
            data: None,
            expires_at: container.expires_at,
            swr_before: container.swr_before,
        };
        let expired = container.is_expired(now);

        if !expired || options.include_expired {
            entry.data = state
                .raw_at(path)
                .map(|raw| denormalize(raw, &state.normalized));
        }
        state.metrics.record(entry.data.is_some() && !expired);
        entry
    }

    /// Shallow read for accessors; includes expired data.
    pub(crate) fn read(&self, path: &CachePath) -> CacheRead {
        let mut state = self.state.lock();
        let key = ContainerKey::new(path.root, path.field.clone());
        let Some(container) = state.containers.get(&key) else {
            state.metrics.record(false);
            return CacheRead::default();
        };
        let mut read = CacheRead {
            value: None,
            expires_at: container.expires_at,
            swr_before: container.swr_before,
            skeleton: false,
        };
        if let Some(slot) = state.slot_of(path) {
            read.skeleton = state.skeletons.contains(&slot);
            read.value = state
                .slot_value(&slot)
                .and_then(|raw| state.deref(raw))
                .cloned();
        }
        state.metrics.record(read.value.is_some() && !read.skeleton);
        read
    }

    /// Whether the value at `path` is a placeholder.
    pub fn is_skeleton(&self, path: &str) -> Result<bool, ValidationError> {
        let path = CachePath::parse(path)?;
        let state = self.state.lock();
        Ok(state
            .slot_of(&path)
            .is_some_and(|slot| state.skeletons.contains(&slot)))
    }

    /// Write a response-shaped payload: `{ root: { field: value } }`.
    ///
    /// Each `(root, field)` container is replaced wholesale; identified objects
    /// are merged into the normalized table.
    pub fn set(&self, values: &Value, options: SetOptions) -> Result<(), ValidationError> {
        let Value::Object(roots) = values else {
            return Err(ValidationError::malformed_path(
                values.to_string(),
                "payload must be an object keyed by operation type",
            ));
        };

        let mut parsed = Vec::new();
        for (root_name, fields) in roots {
            let root = root_name.parse::<OperationType>().map_err(|_| {
                ValidationError::malformed_path(root_name.as_str(), "unknown root")
            })?;
            let Value::Object(fields) = fields else {
                return Err(ValidationError::malformed_path(
                    root_name.as_str(),
                    "root value must be an object",
                ));
            };
            parsed.push((root, fields));
        }

        let now = Instant::now();
        let mut touched = Touched::new();
        let mut writes = Vec::new();
        let listeners = {
            let mut state = self.state.lock();
            for (root, fields) in parsed {
                for (field, value) in fields {
                    let stored = self.normalize(value.clone(), &mut state, &mut touched);
                    let key = ContainerKey::new(root, field.clone());
                    state.drop_container_skeletons(&key);
                    state.containers.put(
                        key,
                        CacheDataContainer::for_root(
                            root,
                            stored,
                            self.options.max_age,
                            self.options.stale_while_revalidate,
                            now,
                        ),
                    );
                    writes.push(WriteEvent {
                        path: CachePath::new(root, field.clone()),
                        value,
                    });
                }
            }
            state.drop_object_skeletons(&touched);
            debug!(
                "Cache set: {} containers, {} normalized objects touched",
                writes.len(),
                touched.len()
            );

            state.sweep(now);
            state.enforce_capacity(self.options.max_entries);
            self.announce(&state, &writes, &touched, options.skip_notify)
        };

        for listener in listeners {
            listener(values);
        }
        Ok(())
    }

    /// Write `value` at `path`, through normalized references.
    ///
    /// Returns `false` when the parent of `path` does not exist.
    pub fn write(&self, path: &CachePath, value: Value) -> bool {
        if path.rest.is_empty() {
            let mut fields = Map::new();
            fields.insert(path.field.clone(), value);
            let mut roots = Map::new();
            roots.insert(path.root.to_string(), Value::Object(fields));
            return self.set(&Value::Object(roots), SetOptions::default()).is_ok();
        }

        let mut touched = Touched::new();
        let listeners = {
            let mut state = self.state.lock();
            let Some(slot) = state.slot_of(path) else {
                return false;
            };
            let stored = self.normalize(value.clone(), &mut state, &mut touched);
            if !state.write_slot(&slot, stored) {
                return false;
            }
            state.skeletons.retain(|s| !slot.contains(s));
            if let Owner::Object(id) = &slot.owner {
                touched
                    .entry(id.clone())
                    .or_default()
                    .extend(slot.path.first().cloned());
            }
            state.drop_object_skeletons(&touched);
            trace!("Cache write at {}", path);

            let writes = [WriteEvent {
                path: path.clone(),
                value: &value,
            }];
            self.announce(&state, &writes, &touched, false)
        };

        for listener in listeners {
            listener(&value);
        }
        true
    }

    /// Seed a placeholder at `path` if nothing is stored there yet.
    pub(crate) fn seed_skeleton(&self, path: &CachePath, placeholder: Value) -> bool {
        let mut state = self.state.lock();
        if path.rest.is_empty() {
            let key = ContainerKey::new(path.root, path.field.clone());
            if state.containers.contains(&key) {
                return false;
            }
            let container = CacheDataContainer::for_root(
                path.root,
                placeholder,
                self.options.max_age,
                self.options.stale_while_revalidate,
                Instant::now(),
            );
            state.containers.put(key.clone(), container);
            state.skeletons.insert(Slot {
                owner: Owner::Container(key),
                path: Vec::new(),
            });
            state.enforce_capacity(self.options.max_entries);
            return true;
        }

        let Some(slot) = state.slot_of(path) else {
            return false;
        };
        if state.slot_value(&slot).is_some() || !state.write_slot(&slot, placeholder) {
            return false;
        }
        trace!("Seeded placeholder at {}", path);
        state.skeletons.insert(slot);
        true
    }

    fn normalize(&self, value: Value, state: &mut CacheState, touched: &mut Touched) -> Value {
        match &self.options.normalization {
            Some(normalizer) => normalizer.normalize(value, &mut state.normalized, touched),
            None => value,
        }
    }

    /// Pick the listeners for a write, then refresh what subscribers reach.
    fn announce(
        &self,
        state: &CacheState,
        writes: &[WriteEvent<'_>],
        touched: &Touched,
        skip_notify: bool,
    ) -> Vec<CacheListener> {
        let mut registry = self.subscriptions.lock();
        let listeners = if skip_notify {
            Vec::new()
        } else {
            let ids: HashSet<String> = touched.keys().cloned().collect();
            registry.interested(writes, &ids)
        };
        registry.refresh_reached(|p, out| state.reach(p, out));
        listeners
    }

    /// Subscribe to writes concerning any of `paths`.
    pub fn subscribe<F>(&self, paths: &[&str], listener: F) -> Result<CacheSubscription, ValidationError>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let paths = paths
            .iter()
            .map(|p| CachePath::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.register(Some(paths), Arc::new(listener)))
    }

    /// Subscribe to writes concerning any of the parsed `paths`.
    pub fn subscribe_paths<F>(&self, paths: Vec<CachePath>, listener: F) -> CacheSubscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(Some(paths), Arc::new(listener))
    }

    /// Subscribe to every write.
    pub fn subscribe_all<F>(&self, listener: F) -> CacheSubscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(listener))
    }

    fn register(&self, paths: Option<Vec<CachePath>>, listener: CacheListener) -> CacheSubscription {
        let state = self.state.lock();
        let mut registry = self.subscriptions.lock();
        let id = registry.insert(paths, listener);
        registry.refresh_reached(|p, out| state.reach(p, out));
        CacheSubscription::new(id, &self.subscriptions)
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Remove the container at `root.field`, or the value at a deeper path.
    pub fn evict(&self, path: &str) -> Result<bool, ValidationError> {
        let path = CachePath::parse(path)?;
        let mut state = self.state.lock();
        if path.rest.is_empty() {
            let key = ContainerKey::new(path.root, path.field.clone());
            let removed = state.containers.pop(&key).is_some();
            if removed {
                state.drop_container_skeletons(&key);
                state.metrics.evictions += 1;
            }
            return Ok(removed);
        }

        let Some(slot) = state.slot_of(&path) else {
            return Ok(false);
        };
        if state.slot_value(&slot).is_none() {
            return Ok(false);
        }
        let removed = state
            .owner_value_mut(&slot.owner)
            .is_some_and(|value| snapshot::remove_at(value, &slot.path));
        if removed {
            state.skeletons.retain(|s| !slot.contains(s));
        }
        Ok(removed)
    }

    /// Reclaim expired weak containers and unreachable normalized objects.
    ///
    /// Returns the number of containers removed.
    pub fn sweep(&self) -> usize {
        self.state.lock().sweep(Instant::now())
    }

    /// Run [`Cache::sweep`] every `interval` until the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep();
                if removed > 0 {
                    debug!("Sweeper removed {} containers", removed);
                }
            }
        })
    }

    /// Drop all data. Subscriptions stay registered.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.containers.clear();
        state.normalized.clear();
        state.skeletons.clear();
    }

    /// Logical snapshot of unexpired data, without placeholders.
    pub fn to_snapshot(&self) -> CacheSnapshot {
        let now = Instant::now();
        let state = self.state.lock();
        let mut snapshot = CacheSnapshot {
            query: Some(Map::new()),
            version: Some(SNAPSHOT_VERSION.to_string()),
            ..Default::default()
        };

        for (key, container) in state.containers.iter() {
            if container.is_expired(now) {
                continue;
            }
            let Some(value) = state.stripped(&Owner::Container(key.clone())) else {
                continue;
            };
            snapshot
                .root_mut(key.root)
                .get_or_insert_with(Map::new)
                .insert(key.field.clone(), value);
        }

        if !state.normalized.is_empty() {
            let normalized = state
                .normalized
                .keys()
                .filter_map(|id| {
                    state
                        .stripped(&Owner::Object(id.clone()))
                        .map(|v| (id.clone(), v))
                })
                .collect();
            snapshot.normalized = Some(normalized);
        }
        snapshot
    }

    /// [`Cache::to_snapshot`] as JSON.
    pub fn to_json(&self) -> Value {
        self.to_snapshot().to_value()
    }

    /// Load a snapshot. Restored containers get a fresh lifetime.
    pub fn restore(&self, snapshot: &CacheSnapshot) -> Result<(), ValidationError> {
        snapshot.validate()?;
        if snapshot.version.as_deref().is_some_and(|v| v != SNAPSHOT_VERSION) {
            warn!(
                "Restoring snapshot version {:?}, expected {}",
                snapshot.version, SNAPSHOT_VERSION
            );
        }

        let payload = snapshot.to_value();
        let now = Instant::now();
        let mut touched = Touched::new();
        let mut writes = Vec::new();
        let listeners = {
            let mut state = self.state.lock();
            if let Some(normalized) = &snapshot.normalized {
                for (id, value) in normalized {
                    if let Value::Object(map) = value {
                        touched.insert(id.clone(), map.keys().cloned().collect());
                    }
                    state.normalized.insert(id.clone(), value.clone());
                }
            }
            for root in OperationType::ALL {
                let Some(fields) = snapshot.root(root) else {
                    continue;
                };
                for (field, value) in fields {
                    let key = ContainerKey::new(root, field.clone());
                    state.drop_container_skeletons(&key);
                    state.containers.put(
                        key,
                        CacheDataContainer::for_root(
                            root,
                            value.clone(),
                            self.options.max_age,
                            self.options.stale_while_revalidate,
                            now,
                        ),
                    );
                    writes.push(WriteEvent {
                        path: CachePath::new(root, field.clone()),
                        value,
                    });
                }
            }
            state.drop_object_skeletons(&touched);
            state.enforce_capacity(self.options.max_entries);
            debug!(
                "Restored {} containers and {} normalized objects",
                writes.len(),
                touched.len()
            );
            self.announce(&state, &writes, &touched, false)
        };

        for listener in listeners {
            listener(&payload);
        }
        Ok(())
    }

    /// Parse and load a JSON snapshot.
    pub fn restore_json(&self, value: Value) -> Result<(), ValidationError> {
        self.restore(&CacheSnapshot::from_value(value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn get(cache: &Cache, path: &str) -> Option<Value> {
        cache.get(path, GetOptions::default()).unwrap().data
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&Value) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: &Value| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_set_then_get_scalar() {
        let cache = Cache::default();
        cache.set(&json!({"query": {"a": 1}}), SetOptions::default()).unwrap();
        assert_eq!(get(&cache, "query.a"), Some(json!(1)));
        assert_eq!(get(&cache, "query.b"), None);
    }

    #[test]
    fn test_get_nested_and_array_paths() {
        let cache = Cache::default();
        cache
            .set(
                &json!({"query": {"list": [{"name": "x"}, {"name": "y"}]}}),
                SetOptions::default(),
            )
            .unwrap();
        assert_eq!(get(&cache, "query.list.1.name"), Some(json!("y")));
        assert_eq!(get(&cache, "query.list.5"), None);
    }

    #[test]
    fn test_malformed_paths() {
        let cache = Cache::default();
        assert!(matches!(
            cache.get("query", GetOptions::default()),
            Err(ValidationError::MalformedPath { .. })
        ));
        assert!(cache.set(&json!({"viewer": {"a": 1}}), SetOptions::default()).is_err());
        assert!(cache.set(&json!([1]), SetOptions::default()).is_err());
    }

    #[test]
    fn test_normalized_objects_merge_across_paths() {
        let cache = Cache::default();
        cache
            .set(
                &json!({"query": {"a": {"__typename": "A", "id": 1, "x": 1}}}),
                SetOptions::default(),
            )
            .unwrap();
        cache
            .set(
                &json!({"query": {"b": {"__typename": "A", "id": 1, "y": 2}}}),
                SetOptions::default(),
            )
            .unwrap();

        let snapshot = cache.to_json();
        assert_eq!(
            snapshot["normalized"]["A:1"],
            json!({"__typename": "A", "id": 1, "x": 1, "y": 2})
        );
        assert_eq!(get(&cache, "query.a.y"), Some(json!(2)));
        assert_eq!(get(&cache, "query.b.x"), Some(json!(1)));
    }

    #[test]
    fn test_normalization_disabled_keeps_copies() {
        let cache = Cache::new(CacheOptions {
            normalization: None,
            ..Default::default()
        });
        cache
            .set(
                &json!({"query": {"a": {"__typename": "A", "id": 1, "x": 1}}}),
                SetOptions::default(),
            )
            .unwrap();
        assert_eq!(cache.normalized_len(), 0);
        assert_eq!(get(&cache, "query.a.x"), Some(json!(1)));
    }

    #[test]
    fn test_cyclic_reads_emit_back_references() {
        let cache = Cache::default();
        cache
            .set(
                &json!({"query": {"me": {"__typename": "U", "id": 1, "best": {"__typename": "U", "id": 2, "best": {"__typename": "U", "id": 1}}}}}),
                SetOptions::default(),
            )
            .unwrap();
        let me = get(&cache, "query.me").unwrap();
        assert_eq!(me["best"]["id"], json!(2));
        assert_eq!(me["best"]["best"], json!({"__ref": "U:1"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_and_include_expired() {
        let cache = Cache::new(CacheOptions {
            max_age: Some(Duration::from_millis(100)),
            stale_while_revalidate: Duration::from_millis(100),
            ..Default::default()
        });
        cache.set(&json!({"query": {"a": 1}}), SetOptions::default()).unwrap();

        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(get(&cache, "query.a"), Some(json!(1)));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(get(&cache, "query.a"), None);
        let entry = cache
            .get("query.a", GetOptions { include_expired: true })
            .unwrap();
        assert_eq!(entry.data, Some(json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_reclaims_weak_containers() {
        let cache = Cache::new(CacheOptions {
            max_age: Some(Duration::from_millis(10)),
            stale_while_revalidate: Duration::from_millis(10),
            ..Default::default()
        });
        cache
            .set(
                &json!({"query": {"a": {"__typename": "A", "id": 1}}}),
                SetOptions::default(),
            )
            .unwrap();
        assert_eq!(cache.normalized_len(), 1);

        tokio::time::advance(Duration::from_millis(15)).await;
        assert_eq!(cache.sweep(), 0);

        tokio::time::advance(Duration::from_millis(5)).await;
        assert_eq!(cache.sweep(), 1);
        assert!(cache.is_empty());
        assert_eq!(cache.normalized_len(), 0);
        assert_eq!(cache.metrics().evictions, 1);
        assert_eq!(cache.metrics().collected_objects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_sweeper() {
        let cache = Arc::new(Cache::new(CacheOptions {
            max_age: Some(Duration::from_millis(10)),
            stale_while_revalidate: Duration::ZERO,
            ..Default::default()
        }));
        cache.set(&json!({"query": {"a": 1}}), SetOptions::default()).unwrap();
        let handle = cache.spawn_sweeper(Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(cache.is_empty());
        handle.abort();
    }

    #[test]
    fn test_strong_entries_survive_capacity() {
        let cache = Cache::new(CacheOptions {
            max_entries: 2,
            ..Default::default()
        });
        for field in ["a", "b", "c"] {
            cache
                .set(&json!({"query": {field: 1}}), SetOptions::default())
                .unwrap();
        }
        assert_eq!(cache.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lru_evicts_weak_entries() {
        let cache = Cache::new(CacheOptions {
            max_age: Some(Duration::from_secs(60)),
            max_entries: 2,
            ..Default::default()
        });
        cache.set(&json!({"query": {"a": 1}}), SetOptions::default()).unwrap();
        cache.set(&json!({"query": {"b": 2}}), SetOptions::default()).unwrap();
        // Touch `a` so `b` becomes least recently used
        assert_eq!(get(&cache, "query.a"), Some(json!(1)));
        cache.set(&json!({"query": {"c": 3}}), SetOptions::default()).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(get(&cache, "query.b"), None);
        assert_eq!(get(&cache, "query.a"), Some(json!(1)));
    }

    #[test]
    fn test_path_subscription() {
        let cache = Cache::default();
        let (count, listener) = counter();
        let _sub = cache.subscribe(&["query.a"], listener).unwrap();

        cache.set(&json!({"query": {"b": 1}}), SetOptions::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        cache.set(&json!({"query": {"a": 1}}), SetOptions::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        cache
            .set(&json!({"query": {"a": 2}}), SetOptions { skip_notify: true })
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_identity_subscription_across_paths() {
        let cache = Cache::default();
        cache
            .set(
                &json!({"query": {"a": {"__typename": "A", "id": 1, "x": 1}}}),
                SetOptions::default(),
            )
            .unwrap();

        let (count, listener) = counter();
        let _sub = cache.subscribe(&["query.a"], listener).unwrap();

        cache
            .set(
                &json!({"query": {"b": {"__typename": "A", "id": 1, "x": 5}}}),
                SetOptions::default(),
            )
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(get(&cache, "query.a.x"), Some(json!(5)));
    }

    #[test]
    fn test_scalar_subscription_through_normalized_object() {
        let cache = Cache::default();
        cache
            .set(
                &json!({"query": {"a": {"__typename": "A", "id": 1, "x": 1}}}),
                SetOptions::default(),
            )
            .unwrap();

        let (count, listener) = counter();
        let _sub = cache.subscribe(&["query.a.x"], listener).unwrap();

        cache
            .set(
                &json!({"query": {"b": {"__typename": "A", "id": 1, "x": 5}}}),
                SetOptions::default(),
            )
            .unwrap();
        assert_eq!(get(&cache, "query.a.x"), Some(json!(5)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_subscription_to_missing_field_of_normalized_object() {
        let cache = Cache::default();
        cache
            .set(
                &json!({"query": {"a": {"__typename": "A", "id": 1}}}),
                SetOptions::default(),
            )
            .unwrap();

        let (count, listener) = counter();
        let _sub = cache.subscribe(&["query.a.name"], listener).unwrap();

        cache
            .set(
                &json!({"query": {"b": {"__typename": "A", "id": 1, "name": "n"}}}),
                SetOptions::default(),
            )
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_on_drop() {
        let cache = Cache::default();
        let (count, listener) = counter();
        let sub = cache.subscribe_all(listener);
        assert_eq!(cache.subscription_count(), 1);
        drop(sub);
        assert_eq!(cache.subscription_count(), 0);

        cache.set(&json!({"query": {"a": 1}}), SetOptions::default()).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listener_may_reenter_cache() {
        let cache = Arc::new(Cache::default());
        let seen = Arc::new(Mutex::new(None));
        let (c, s) = (Arc::clone(&cache), Arc::clone(&seen));
        let _sub = cache.subscribe_all(move |_| {
            *s.lock() = c.get("query.a", GetOptions::default()).unwrap().data;
        });
        cache.set(&json!({"query": {"a": 7}}), SetOptions::default()).unwrap();
        assert_eq!(*seen.lock(), Some(json!(7)));
    }

    #[test]
    fn test_write_through_reference_updates_object() {
        let cache = Cache::default();
        cache
            .set(
                &json!({"query": {"a": {"__typename": "A", "id": 1, "x": 1}, "b": {"__typename": "A", "id": 1}}}),
                SetOptions::default(),
            )
            .unwrap();
        assert!(cache.write(&CachePath::parse("query.a.x").unwrap(), json!(9)));
        assert_eq!(get(&cache, "query.b.x"), Some(json!(9)));
        assert!(!cache.write(&CachePath::parse("query.missing.x").unwrap(), json!(1)));
    }

    #[test]
    fn test_skeletons_are_excluded_from_snapshots() {
        let cache = Cache::default();
        assert!(cache.seed_skeleton(&CachePath::parse("query.user").unwrap(), json!({})));
        assert!(cache.is_skeleton("query.user").unwrap());
        assert!(cache.seed_skeleton(&CachePath::parse("query.user.friends").unwrap(), json!([])));
        assert!(!cache.seed_skeleton(&CachePath::parse("query.user.friends").unwrap(), json!([])));

        let snapshot = cache.to_snapshot();
        assert_eq!(snapshot.query, Some(Map::new()));

        cache
            .set(&json!({"query": {"user": {"name": "a"}}}), SetOptions::default())
            .unwrap();
        assert!(!cache.is_skeleton("query.user").unwrap());
        assert_eq!(cache.to_json()["query"]["user"], json!({"name": "a"}));
    }

    #[test]
    fn test_genuine_empty_objects_are_kept() {
        let cache = Cache::default();
        cache
            .set(&json!({"query": {"empty": {}, "none": []}}), SetOptions::default())
            .unwrap();
        let snapshot = cache.to_json();
        assert_eq!(snapshot["query"]["empty"], json!({}));
        assert_eq!(snapshot["query"]["none"], json!([]));
    }

    #[test]
    fn test_snapshot_round_trip_with_cycles() {
        let cache = Cache::default();
        cache
            .set(
                &json!({"query": {
                    "me": {"__typename": "U", "id": 1, "friends": [{"__typename": "U", "id": 2, "friends": [{"__typename": "U", "id": 1}]}]},
                    "count": 3
                }}),
                SetOptions::default(),
            )
            .unwrap();

        let restored = Cache::default();
        restored.restore_json(cache.to_json()).unwrap();

        for path in ["query.me", "query.count", "query.me.friends.0.friends.0"] {
            assert_eq!(get(&restored, path), get(&cache, path), "{}", path);
        }
        assert_eq!(restored.to_snapshot(), cache.to_snapshot());
    }

    #[test]
    fn test_restore_rejects_invalid_snapshots() {
        let cache = Cache::default();
        assert!(matches!(
            cache.restore_json(json!({"version": "1"})),
            Err(ValidationError::InvalidSnapshot(_))
        ));
        assert!(matches!(
            cache.restore_json(json!({"query": {"a": {"__ref": "X:1"}}})),
            Err(ValidationError::UnresolvedReference(_))
        ));
    }

    #[test]
    fn test_evict_and_clear() {
        let cache = Cache::default();
        cache
            .set(&json!({"query": {"a": {"b": 1, "c": 2}, "d": 3}}), SetOptions::default())
            .unwrap();
        assert!(cache.evict("query.a.b").unwrap());
        assert_eq!(get(&cache, "query.a"), Some(json!({"c": 2})));
        assert!(cache.evict("query.d").unwrap());
        assert!(!cache.evict("query.d").unwrap());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_list_element() {
        let cache = Cache::default();
        cache
            .set(&json!({"query": {"list": [1, 2, 3]}}), SetOptions::default())
            .unwrap();
        assert!(cache.evict("query.list.0").unwrap());
        assert_eq!(get(&cache, "query.list"), Some(json!([null, 2, 3])));
        assert_eq!(get(&cache, "query.list.1"), Some(json!(2)));
        assert!(!cache.evict("query.list.9").unwrap());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_metrics_count_hits_and_misses() {
        let cache = Cache::default();
        cache.set(&json!({"query": {"a": 1}}), SetOptions::default()).unwrap();
        get(&cache, "query.a");
        get(&cache, "query.missing");
        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = CacheConfig::default();
        assert!(CacheOptions::from(&config).max_age.is_none());

        config.max_age_ms = 500;
        config.normalization = false;
        let options = CacheOptions::from(&config);
        assert_eq!(options.max_age, Some(Duration::from_millis(500)));
        assert!(options.normalization.is_none());

        config.immutable = true;
        assert!(CacheOptions::from(&config).max_age.is_none());
    }
}
