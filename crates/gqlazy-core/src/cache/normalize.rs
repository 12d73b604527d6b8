//! Object-identity normalization.
//!
//! Objects with an identity are stored once in the normalized table and
//! replaced in place by `{"__ref": id}`. Incoming data for an existing identity
//! is merged into the stored object, so a write through any path is visible
//! through every other path that references it.

use gqlazy_config::ArrayMergeMode;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Key of reference objects.
pub const REF_KEY: &str = "__ref";

/// Nesting depth beyond which incoming data is stored as-is.
pub const MAX_NORMALIZATION_DEPTH: usize = 15;

/// Computes the identity of an object, `None` opting it out.
pub type IdentityFn = Arc<dyn Fn(&Map<String, Value>) -> Option<String> + Send + Sync>;

/// Replaces the default merge: `(id, existing, incoming) -> merged`.
pub type MergeResolver =
    Arc<dyn Fn(&str, &Map<String, Value>, &Map<String, Value>) -> Map<String, Value> + Send + Sync>;

/// Normalized ids written by one operation, with the keys written to each.
pub(crate) type Touched = HashMap<String, HashSet<String>>;

/// Policy for array fields present in both the stored and incoming object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArrayMergePolicy {
    /// Equal lengths keep the stored array, different lengths replace it
    #[default]
    KeepEqualLength,
    /// Always take the incoming array
    Replace,
}

impl From<ArrayMergeMode> for ArrayMergePolicy {
    fn from(mode: ArrayMergeMode) -> Self {
        match mode {
            ArrayMergeMode::KeepEqualLength => Self::KeepEqualLength,
            ArrayMergeMode::Replace => Self::Replace,
        }
    }
}

/// Normalization settings.
#[derive(Clone)]
pub struct Normalizer {
    identity: IdentityFn,
    array_merge: ArrayMergePolicy,
    resolver: Option<MergeResolver>,
}

impl fmt::Debug for Normalizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Normalizer")
            .field("array_merge", &self.array_merge)
            .field("resolver", &self.resolver.is_some())
            .finish()
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::with_identity_fields(vec!["id".to_string(), "_id".to_string()])
    }
}

impl Normalizer {
    /// Identity `"{__typename}:{first present identity field}"`.
    pub fn with_identity_fields(fields: Vec<String>) -> Self {
        let identity: IdentityFn = Arc::new(move |object| {
            let typename = object.get("__typename")?.as_str()?;
            fields.iter().find_map(|field| {
                let id = match object.get(field)? {
                    Value::String(s) => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some(format!("{}:{}", typename, id))
            })
        });
        Self {
            identity,
            array_merge: ArrayMergePolicy::default(),
            resolver: None,
        }
    }

    /// Use a custom identity function.
    pub fn with_identity(identity: IdentityFn) -> Self {
        Self {
            identity,
            array_merge: ArrayMergePolicy::default(),
            resolver: None,
        }
    }

    pub fn array_merge(mut self, policy: ArrayMergePolicy) -> Self {
        self.array_merge = policy;
        self
    }

    pub fn resolver(mut self, resolver: MergeResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn identify(&self, object: &Map<String, Value>) -> Option<String> {
        (self.identity)(object)
    }

    /// Normalize `value`, merging identified objects into `table`.
    ///
    /// Every object written is recorded in `touched` with its incoming keys.
    pub(crate) fn normalize(
        &self,
        value: Value,
        table: &mut HashMap<String, Value>,
        touched: &mut Touched,
    ) -> Value {
        self.normalize_at(value, 0, table, touched)
    }

    fn normalize_at(
        &self,
        value: Value,
        depth: usize,
        table: &mut HashMap<String, Value>,
        touched: &mut Touched,
    ) -> Value {
        if depth > MAX_NORMALIZATION_DEPTH {
            return value;
        }
        match value {
            Value::Array(items) => Value::Array(
                items
                    .into_iter()
                    .map(|item| self.normalize_at(item, depth + 1, table, touched))
                    .collect(),
            ),
            Value::Object(object) if ref_id_of_map(&object).is_none() => {
                let object: Map<String, Value> = object
                    .into_iter()
                    .map(|(k, v)| (k, self.normalize_at(v, depth + 1, table, touched)))
                    .collect();

                let Some(id) = self.identify(&object) else {
                    return Value::Object(object);
                };

                touched
                    .entry(id.clone())
                    .or_default()
                    .extend(object.keys().cloned());
                let merged = match table.get(&id) {
                    Some(Value::Object(existing)) => self.merge(&id, existing, object),
                    _ => object,
                };
                trace!("Normalized object {}", id);
                table.insert(id.clone(), Value::Object(merged));
                reference(&id)
            }
            other => other,
        }
    }

    /// Merge incoming fields into a stored object.
    pub(crate) fn merge(
        &self,
        id: &str,
        existing: &Map<String, Value>,
        incoming: Map<String, Value>,
    ) -> Map<String, Value> {
        if let Some(resolver) = &self.resolver {
            return resolver(id, existing, &incoming);
        }

        let mut merged = existing.clone();
        for (key, value) in incoming {
            let unchanged = self.array_merge == ArrayMergePolicy::KeepEqualLength
                && matches!(
                    (merged.get(&key), &value),
                    (Some(Value::Array(old)), Value::Array(new)) if old.len() == new.len()
                );
            if !unchanged {
                merged.insert(key, value);
            }
        }
        merged
    }
}

/// `{"__ref": id}`
pub fn reference(id: &str) -> Value {
    let mut map = Map::new();
    map.insert(REF_KEY.to_string(), Value::String(id.to_string()));
    Value::Object(map)
}

/// Id of a reference object.
pub fn ref_id(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) => ref_id_of_map(map),
        _ => None,
    }
}

fn ref_id_of_map(map: &Map<String, Value>) -> Option<&str> {
    if map.len() == 1 {
        map.get(REF_KEY).and_then(Value::as_str)
    } else {
        None
    }
}

/// Resolve every reference, emitting `{"__ref": id}` for back-edges.
pub(crate) fn denormalize(value: &Value, table: &HashMap<String, Value>) -> Value {
    fn go(value: &Value, table: &HashMap<String, Value>, stack: &mut Vec<String>) -> Value {
        if let Some(id) = ref_id(value) {
            if stack.iter().any(|s| s == id) {
                return value.clone();
            }
            let Some(target) = table.get(id) else {
                return value.clone();
            };
            stack.push(id.to_string());
            let resolved = go(target, table, stack);
            stack.pop();
            return resolved;
        }
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), go(v, table, stack)))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| go(v, table, stack)).collect()),
            other => other.clone(),
        }
    }
    go(value, table, &mut Vec::new())
}

/// Collect the ids reachable from `value`, following references transitively.
pub(crate) fn collect_reachable(value: &Value, table: &HashMap<String, Value>, out: &mut HashSet<String>) {
    let mut pending = vec![value];
    while let Some(current) = pending.pop() {
        if let Some(id) = ref_id(current) {
            if out.insert(id.to_string()) {
                if let Some(target) = table.get(id) {
                    pending.push(target);
                }
            }
            continue;
        }
        match current {
            Value::Object(map) => pending.extend(map.values()),
            Value::Array(items) => pending.extend(items.iter()),
            _ => {}
        }
    }
}

/// Collect references directly present in `value` (not following them).
pub(crate) fn collect_refs(value: &Value, out: &mut Vec<String>) {
    if let Some(id) = ref_id(value) {
        out.push(id.to_string());
        return;
    }
    match value {
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}
