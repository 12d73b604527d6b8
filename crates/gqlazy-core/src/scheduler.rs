//! Fetch batching.
//!
//! Selections added during a debounce window are collected into one group and
//! handed to the fetch callback exactly once when the window closes. Every
//! caller that contributed to a group, and every later caller whose selections
//! overlap a group that has not settled yet, awaits the same shared future.
//!
//! Windows are kept per [`BatchKey`] so operations with different names or
//! extensions never end up in the same request.

use crate::error::TransportError;
use crate::hash::canonical_json;
use crate::selection::Selection;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

/// Result a group settles with.
pub type FetchResult = Result<(), TransportError>;

/// Fetches one group of selections.
pub type FetchCallback =
    Arc<dyn Fn(Vec<Arc<Selection>>, BatchKey) -> BoxFuture<'static, FetchResult> + Send + Sync>;

/// Called after every group settles, success or failure.
pub type SettledListener = Arc<dyn Fn(&FetchResult) + Send + Sync>;

type GroupFuture = Shared<BoxFuture<'static, FetchResult>>;

/// Partition of the pending windows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub operation_name: Option<String>,
    /// Canonical JSON of the request extensions
    extensions: Option<String>,
}

impl BatchKey {
    pub fn new(operation_name: Option<String>, extensions: Option<&Map<String, Value>>) -> Self {
        Self {
            operation_name,
            extensions: extensions.map(|e| canonical_json(&Value::Object(e.clone()))),
        }
    }

    /// Extensions to send with the request.
    pub fn extensions(&self) -> Option<Map<String, Value>> {
        self.extensions
            .as_deref()
            .and_then(|text| serde_json::from_str(text).ok())
    }
}

/// An open window collecting selections.
struct Window {
    group: u64,
    selections: Vec<Arc<Selection>>,
    future: GroupFuture,
}

#[derive(Default)]
struct SchedulerState {
    next_group: u64,
    windows: HashMap<BatchKey, Window>,
    /// Selection id -> group that will fetch it
    pending: HashMap<u64, (u64, GroupFuture)>,
}

struct SchedulerInner {
    window: Duration,
    fetch: FetchCallback,
    state: Mutex<SchedulerState>,
    listeners: Mutex<Vec<SettledListener>>,
}

/// Debouncing, deduplicating fetch scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("window", &self.inner.window)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl Scheduler {
    /// Create a scheduler. A zero `window` closes after one task yield.
    pub fn new(window: Duration, fetch: FetchCallback) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                window,
                fetch,
                state: Mutex::new(SchedulerState::default()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Schedule `selections` and return a future that settles with their group.
    ///
    /// Selections already pending attach to their existing group; the rest
    /// join the open window for `key`, opening one if needed. Must be called
    /// from within a tokio runtime.
    pub fn add(&self, selections: Vec<Arc<Selection>>, key: BatchKey) -> BoxFuture<'static, FetchResult> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let mut groups = HashSet::new();
        let mut waiting = Vec::new();
        let mut fresh = Vec::new();
        for selection in selections {
            match state.pending.get(&selection.id()) {
                Some((group, future)) => {
                    if groups.insert(*group) {
                        waiting.push(future.clone());
                    }
                }
                None => fresh.push(selection),
            }
        }

        if !fresh.is_empty() {
            let window = match state.windows.entry(key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    state.next_group += 1;
                    let group = state.next_group;
                    let (tx, rx) = oneshot::channel();
                    let future = rx
                        .map(|settled| settled.unwrap_or(Err(TransportError::Cancelled)))
                        .boxed()
                        .shared();
                    debug!("Opening window for group {} ({:?})", group, key.operation_name);
                    tokio::spawn(run_window(Arc::clone(&self.inner), key, group, tx));
                    entry.insert(Window {
                        group,
                        selections: Vec::new(),
                        future,
                    })
                }
            };
            for selection in fresh {
                if state
                    .pending
                    .insert(selection.id(), (window.group, window.future.clone()))
                    .is_none()
                {
                    window.selections.push(selection);
                }
            }
            if groups.insert(window.group) {
                waiting.push(window.future.clone());
            }
        }
        drop(guard);

        trace!("Selections attached to {} groups", waiting.len());
        async move {
            for future in waiting {
                future.await?;
            }
            Ok(())
        }
        .boxed()
    }

    /// Number of groups that have not settled yet, open windows included.
    pub fn pending_count(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .pending
            .values()
            .map(|(group, _)| *group)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Whether `selection` is part of a group that has not settled.
    pub fn is_pending(&self, selection: &Selection) -> bool {
        self.inner.state.lock().pending.contains_key(&selection.id())
    }

    /// Register a listener called after every group settles.
    pub fn on_settled<F>(&self, listener: F)
    where
        F: Fn(&FetchResult) + Send + Sync + 'static,
    {
        self.inner.listeners.lock().push(Arc::new(listener));
    }
}

/// Removes a group's selections from the pending index when dropped.
struct PendingGuard {
    inner: Arc<SchedulerInner>,
    group: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        state.pending.retain(|_, (group, _)| *group != self.group);
        state.windows.retain(|_, window| window.group != self.group);
    }
}

async fn run_window(
    inner: Arc<SchedulerInner>,
    key: BatchKey,
    group: u64,
    tx: oneshot::Sender<FetchResult>,
) {
    let guard = PendingGuard {
        inner: Arc::clone(&inner),
        group,
    };

    if inner.window.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(inner.window).await;
    }

    let selections = {
        let mut state = inner.state.lock();
        match state.windows.remove(&key) {
            Some(window) => window.selections,
            None => Vec::new(),
        }
    };

    debug!("Dispatching group {} with {} selections", group, selections.len());
    let result = (inner.fetch)(selections, key).await;
    drop(guard);

    if let Err(e) = &result {
        error!("Fetch group {} failed: {}", group, e);
    }
    let listeners = inner.listeners.lock().clone();
    for listener in listeners {
        listener(&result);
    }
    // Nobody awaiting is fine: the outcome has been logged
    let _ = tx.send(result);
}
