//! Cache change subscriptions.
//!
//! Two kinds of fan-out decide who hears about a write:
//! - path-based: the write lands on, above or below a subscribed path;
//! - identity-based: the write touched a normalized object the subscriber's
//!   paths currently reach, even if the write came through another path.
//!
//! The reachable set, including objects a path only passes through, is
//! recomputed after every write.

use super::path::{walk, CachePath};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};

/// Callback invoked with the written payload.
pub type CacheListener = Arc<dyn Fn(&Value) + Send + Sync>;

struct Entry {
    /// `None` subscribes to every write
    paths: Option<Vec<CachePath>>,
    listener: CacheListener,
    reached: HashSet<String>,
}

/// One write to be announced.
pub(crate) struct WriteEvent<'a> {
    pub path: CachePath,
    /// Raw value written at `path`
    pub value: &'a Value,
}

#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    entries: HashMap<u64, Entry>,
}

impl Registry {
    pub fn insert(&mut self, paths: Option<Vec<CachePath>>, listener: CacheListener) -> u64 {
        self.next_id += 1;
        self.entries.insert(
            self.next_id,
            Entry {
                paths,
                listener,
                reached: HashSet::new(),
            },
        );
        self.next_id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Listeners interested in `writes` or in any of the `touched` ids.
    pub fn interested(&self, writes: &[WriteEvent<'_>], touched: &HashSet<String>) -> Vec<CacheListener> {
        self.entries
            .values()
            .filter(|entry| match &entry.paths {
                None => true,
                Some(paths) => {
                    paths.iter().any(|p| writes.iter().any(|w| path_matches(p, w)))
                        || !entry.reached.is_disjoint(touched)
                }
            })
            .map(|entry| Arc::clone(&entry.listener))
            .collect()
    }

    /// Recompute the normalized ids every path subscriber depends on.
    ///
    /// `reach` adds the ids a path passes through or points at.
    pub fn refresh_reached(&mut self, reach: impl Fn(&CachePath, &mut HashSet<String>)) {
        for entry in self.entries.values_mut() {
            let Some(paths) = &entry.paths else {
                continue;
            };
            let mut reached = HashSet::new();
            for path in paths {
                reach(path, &mut reached);
            }
            entry.reached = reached;
        }
    }

    #[cfg(test)]
    pub fn reached(&self, id: u64) -> Option<&HashSet<String>> {
        self.entries.get(&id).map(|e| &e.reached)
    }
}

/// Whether a write at `write.path` concerns a subscriber at `path`.
fn path_matches(path: &CachePath, write: &WriteEvent<'_>) -> bool {
    if path.is_prefix_of(&write.path) {
        return true;
    }
    if write.path.is_prefix_of(path) {
        let remaining = path.rest[write.path.rest.len()..].iter().map(String::as_str);
        return walk(write.value, remaining).is_some();
    }
    false
}

/// Handle returned by `Cache::subscribe`; unsubscribes on drop.
pub struct CacheSubscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl CacheSubscription {
    pub(crate) fn new(id: u64, registry: &Arc<Mutex<Registry>>) -> Self {
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    /// Stop receiving notifications.
    pub fn unsubscribe(self) {
        drop(self)
    }
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(self.id);
        }
    }
}

impl fmt::Debug for CacheSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSubscription").field("id", &self.id).finish()
    }
}
