//! Snapshot format for persisting a cache.
//!
//! ```json
//! {
//!   "query": { "user": { "__ref": "User:1" } },
//!   "normalized": { "User:1": { "__typename": "User", "id": 1, "best": { "__ref": "User:1" } } },
//!   "version": "1"
//! }
//! ```
//!
//! Normalized objects are flattened into `normalized` and referenced as
//! `{"__ref": id}` everywhere else, which keeps cyclic graphs serializable.

use super::normalize::collect_refs;
use crate::error::ValidationError;
use crate::selection::OperationType;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Current snapshot version.
pub const SNAPSHOT_VERSION: &str = "1";

/// Logical snapshot of a cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl CacheSnapshot {
    /// Parse a snapshot from JSON.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        serde_json::from_value(value).map_err(|e| ValidationError::InvalidSnapshot(e.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn root(&self, operation: OperationType) -> Option<&Map<String, Value>> {
        match operation {
            OperationType::Query => self.query.as_ref(),
            OperationType::Mutation => self.mutation.as_ref(),
            OperationType::Subscription => self.subscription.as_ref(),
        }
    }

    pub(crate) fn root_mut(&mut self, operation: OperationType) -> &mut Option<Map<String, Value>> {
        match operation {
            OperationType::Query => &mut self.query,
            OperationType::Mutation => &mut self.mutation,
            OperationType::Subscription => &mut self.subscription,
        }
    }

    /// Check that at least one root is present and every reference resolves.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if OperationType::ALL.iter().all(|op| self.root(*op).is_none()) {
            return Err(ValidationError::InvalidSnapshot(
                "none of query, mutation, subscription present".to_string(),
            ));
        }

        let mut refs = Vec::new();
        for op in OperationType::ALL {
            if let Some(root) = self.root(op) {
                root.values().for_each(|v| collect_refs(v, &mut refs));
            }
        }
        if let Some(normalized) = &self.normalized {
            normalized.values().for_each(|v| collect_refs(v, &mut refs));
        }

        let known = self.normalized.as_ref();
        match refs
            .into_iter()
            .find(|id| !known.is_some_and(|n| n.contains_key(id)))
        {
            Some(missing) => Err(ValidationError::UnresolvedReference(missing)),
            None => Ok(()),
        }
    }
}

/// Remove the value at `path` below `value`. An empty path removes nothing.
///
/// List elements are nulled rather than spliced out so sibling indices stay
/// valid for other paths. Returns whether anything was removed.
pub(crate) fn remove_at(value: &mut Value, path: &[String]) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };
    let mut current = value;
    for segment in parents {
        match super::path::step_mut(current, segment) {
            Some(next) => current = next,
            None => return false,
        }
    }
    match current {
        Value::Object(map) => map.remove(last).is_some(),
        Value::Array(items) => match last.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
            Some(item) => {
                *item = Value::Null;
                true
            }
            None => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_without_roots_is_invalid() {
        let snapshot = CacheSnapshot::from_value(json!({"normalized": {}})).unwrap();
        assert!(matches!(
            snapshot.validate(),
            Err(ValidationError::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn test_unresolved_reference() {
        let snapshot = CacheSnapshot::from_value(json!({
            "query": {"a": {"__ref": "A:1"}}
        }))
        .unwrap();
        assert_eq!(
            snapshot.validate(),
            Err(ValidationError::UnresolvedReference("A:1".to_string()))
        );
    }

    #[test]
    fn test_valid_cyclic_snapshot() {
        let snapshot = CacheSnapshot::from_value(json!({
            "query": {"a": {"__ref": "A:1"}},
            "normalized": {"A:1": {"self": {"__ref": "A:1"}}},
            "version": "1"
        }))
        .unwrap();
        assert!(snapshot.validate().is_ok());
        assert_eq!(
            snapshot.to_value()["normalized"]["A:1"]["self"],
            json!({"__ref": "A:1"})
        );
    }

    #[test]
    fn test_remove_at() {
        let mut value = json!({"a": {"b": {}, "c": 1}});
        assert!(remove_at(&mut value, &["a".to_string(), "b".to_string()]));
        assert_eq!(value, json!({"a": {"c": 1}}));
        assert!(!remove_at(&mut value, &["a".to_string(), "b".to_string()]));

        let mut list = json!({"items": [1, 2, 3]});
        assert!(remove_at(&mut list, &["items".to_string(), "1".to_string()]));
        assert_eq!(list, json!({"items": [1, null, 3]}));
        assert!(!remove_at(&mut list, &["items".to_string(), "7".to_string()]));
    }
}
