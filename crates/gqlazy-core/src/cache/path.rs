//! Cache paths: `root.field[.subpath]`.

use crate::error::ValidationError;
use crate::selection::OperationType;
use serde_json::Value;
use std::fmt;

/// A parsed cache path.
///
/// Segments after the field are object keys or, when the value at that point
/// is an array, element indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CachePath {
    pub root: OperationType,
    pub field: String,
    pub rest: Vec<String>,
}

impl CachePath {
    pub fn new(root: OperationType, field: impl Into<String>) -> Self {
        Self {
            root,
            field: field.into(),
            rest: Vec::new(),
        }
    }

    /// Parse a dotted path. Fails without a known root and a field.
    pub fn parse(path: &str) -> Result<Self, ValidationError> {
        let mut parts = path.split('.');
        let root = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ValidationError::malformed_path(path, "empty path"))?;
        let root = root.parse::<OperationType>().map_err(|_| {
            ValidationError::malformed_path(
                path,
                format!("'{}' is not one of query, mutation, subscription", root),
            )
        })?;
        let field = parts
            .next()
            .ok_or_else(|| ValidationError::malformed_path(path, "missing field after root"))?;

        let mut result = Self::new(root, field);
        for part in std::iter::once(field).chain(parts.clone()) {
            if part.is_empty() {
                return Err(ValidationError::malformed_path(path, "empty segment"));
            }
        }
        result.rest = parts.map(str::to_string).collect();
        Ok(result)
    }

    /// Build a path from selection cache keys (`["query", "a", "b"]`).
    pub fn from_keys(keys: &[String]) -> Result<Self, ValidationError> {
        Self::parse(&keys.join("."))
    }

    /// Path extended by one segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.rest.push(segment.into());
        next
    }

    /// All segments after the root, starting with the field.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.field.as_str()).chain(self.rest.iter().map(String::as_str))
    }

    /// Whether `self` equals `other` or is an ancestor of it.
    pub fn is_prefix_of(&self, other: &CachePath) -> bool {
        self.root == other.root
            && self.field == other.field
            && self.rest.len() <= other.rest.len()
            && self.rest.iter().zip(&other.rest).all(|(a, b)| a == b)
    }
}

impl fmt::Display for CachePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.root, self.field)?;
        for segment in &self.rest {
            write!(f, ".{}", segment)?;
        }
        Ok(())
    }
}

/// Step into an object key or array index.
pub(crate) fn step<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    }
}

/// Mutable counterpart of [`step`].
pub(crate) fn step_mut<'a>(value: &'a mut Value, segment: &str) -> Option<&'a mut Value> {
    match value {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    }
}

/// Walk raw (non-normalized) data along `segments`.
pub(crate) fn walk<'a, 'b>(
    value: &'a Value,
    segments: impl IntoIterator<Item = &'b str>,
) -> Option<&'a Value> {
    segments
        .into_iter()
        .try_fold(value, |current, segment| step(current, segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_path() {
        let path = CachePath::parse("query.user.friends.0.name").unwrap();
        assert_eq!(path.root, OperationType::Query);
        assert_eq!(path.field, "user");
        assert_eq!(path.rest, vec!["friends", "0", "name"]);
        assert_eq!(path.to_string(), "query.user.friends.0.name");
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        for bad in ["", "query", "viewer.name", "query..a", "query.a."] {
            assert!(
                matches!(
                    CachePath::parse(bad),
                    Err(ValidationError::MalformedPath { .. })
                ),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_prefix() {
        let parent = CachePath::parse("query.user").unwrap();
        let child = CachePath::parse("query.user.name").unwrap();
        assert!(parent.is_prefix_of(&child));
        assert!(parent.is_prefix_of(&parent));
        assert!(!child.is_prefix_of(&parent));
        assert!(!CachePath::parse("mutation.user")
            .unwrap()
            .is_prefix_of(&child));
    }

    #[test]
    fn test_walk_objects_and_arrays() {
        let data = json!({"friends": [{"name": "a"}, {"name": "b"}]});
        assert_eq!(walk(&data, ["friends", "1", "name"]), Some(&json!("b")));
        assert_eq!(walk(&data, ["friends", "x"]), None);
    }
}
