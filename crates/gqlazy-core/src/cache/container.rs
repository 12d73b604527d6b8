//! Per-(root, field) data containers and cache metrics.

use crate::selection::OperationType;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// How long mutation and subscription results stay servable.
///
/// Their durable value lives in the normalized objects; the container only
/// needs to survive the re-read that follows the fetch.
pub const OPERATION_RESULT_TTL: Duration = Duration::from_millis(100);

/// Whether a container may be reclaimed by the sweeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retention {
    /// Never swept or evicted
    Strong,
    /// Swept once past `swr_before`, evictable under the LRU cap
    Weak,
}

/// Identifies the container of one root field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ContainerKey {
    pub root: OperationType,
    pub field: String,
}

impl ContainerKey {
    pub fn new(root: OperationType, field: impl Into<String>) -> Self {
        Self {
            root,
            field: field.into(),
        }
    }
}

/// Data stored for one `(root, field)` slot, replaced wholesale on `set`.
#[derive(Debug, Clone)]
pub struct CacheDataContainer {
    /// Stored form: normalized objects appear as `{"__ref": id}`
    pub data: Value,
    /// Hard validity boundary (`None` = never expires)
    pub expires_at: Option<Instant>,
    /// End of the stale-while-revalidate window
    pub swr_before: Option<Instant>,
    pub retention: Retention,
}

impl CacheDataContainer {
    /// Build a container with the lifetime that `root` results get.
    pub fn for_root(
        root: OperationType,
        data: Value,
        max_age: Option<Duration>,
        stale_while_revalidate: Duration,
        now: Instant,
    ) -> Self {
        match (root, max_age) {
            (OperationType::Mutation | OperationType::Subscription, _) => {
                let expires = now + OPERATION_RESULT_TTL;
                Self {
                    data,
                    expires_at: Some(expires),
                    swr_before: Some(expires),
                    retention: Retention::Weak,
                }
            }
            (OperationType::Query, Some(max_age)) => {
                let expires = now + max_age;
                Self {
                    data,
                    expires_at: Some(expires),
                    swr_before: Some(expires + stale_while_revalidate),
                    retention: Retention::Weak,
                }
            }
            (OperationType::Query, None) => Self {
                data,
                expires_at: None,
                swr_before: None,
                retention: Retention::Strong,
            },
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Past both the hard expiry and the stale window.
    pub fn is_reclaimable(&self, now: Instant) -> bool {
        self.retention == Retention::Weak && self.swr_before.is_some_and(|at| now >= at)
    }
}

/// Cache metrics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    /// Reads that found servable data
    pub hits: u64,
    /// Reads that found nothing or only expired data
    pub misses: u64,
    /// Containers removed by the sweeper or the LRU cap
    pub evictions: u64,
    /// Normalized objects removed because nothing references them
    pub collected_objects: u64,
}

impl CacheMetrics {
    /// Get hit rate as a fraction (0.0 - 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub(crate) fn record(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }
}
