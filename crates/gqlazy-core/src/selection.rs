//! Selection tree.
//!
//! A [`Selection`] is one node of the field-access tree: a single field (or
//! array index) with its arguments. Children are memoized under their parent
//! by alias-or-key, so asking for the same `(parent, key, args)` twice yields
//! the same node for as long as the tree exists, across resolution passes.
//!
//! Parents and children hold each other strongly. The owner of a root breaks
//! the cycle with [`Selection::prune`] when the tree is no longer needed;
//! leaves still held elsewhere keep their ancestors and stay compilable.

use crate::hash::{canonical_json, short_hash};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Default length of the argument hash inside generated aliases.
pub const DEFAULT_ALIAS_LENGTH: usize = 6;

/// Key of the synthetic union-narrowing node.
pub const UNION_MARKER: &str = "$on";

static NEXT_SELECTION_ID: AtomicU64 = AtomicU64::new(1);

/// GraphQL operation type, also the root key of cache paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Query,
    Mutation,
    Subscription,
}

impl OperationType {
    /// All operation types in canonical order.
    pub const ALL: [OperationType; 3] = [Self::Query, Self::Mutation, Self::Subscription];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(Self::Query),
            "mutation" => Ok(Self::Mutation),
            "subscription" => Ok(Self::Subscription),
            _ => Err(()),
        }
    }
}

/// Field name or array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SelectionKey {
    Field(String),
    Index(usize),
}

impl SelectionKey {
    pub fn is_index(&self) -> bool {
        matches!(self, Self::Index(_))
    }
}

impl fmt::Display for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => f.write_str(name),
            Self::Index(i) => write!(f, "{}", i),
        }
    }
}

impl From<&str> for SelectionKey {
    fn from(s: &str) -> Self {
        Self::Field(s.to_string())
    }
}

impl From<String> for SelectionKey {
    fn from(s: String) -> Self {
        Self::Field(s)
    }
}

impl From<usize> for SelectionKey {
    fn from(i: usize) -> Self {
        Self::Index(i)
    }
}

/// A typed argument value.
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    /// GraphQL input type, e.g. `ID!` or `[String!]`
    pub type_name: String,
    pub value: Value,
}

impl Argument {
    pub fn new(type_name: impl Into<String>, value: Value) -> Self {
        Self {
            type_name: type_name.into(),
            value,
        }
    }
}

/// Arguments of a field, ordered by name.
pub type SelectionInput = BTreeMap<String, Argument>;

/// Options for [`Selection::get_child`].
#[derive(Debug, Clone, Default)]
pub struct ChildOptions {
    /// Explicit alias; generated from the arguments when absent
    pub alias: Option<String>,
    pub input: Option<SelectionInput>,
    /// Marks a `...on Type` branch under the `$on` node
    pub is_union: bool,
}

impl ChildOptions {
    pub fn with_input(input: SelectionInput) -> Self {
        Self {
            input: Some(input),
            ..Default::default()
        }
    }

    pub fn union_branch() -> Self {
        Self {
            is_union: true,
            ..Default::default()
        }
    }
}

/// One node of the selection tree.
pub struct Selection {
    id: u64,
    key: SelectionKey,
    alias: Option<String>,
    input: Option<SelectionInput>,
    is_union: bool,
    alias_length: usize,
    parent: Option<Arc<Selection>>,
    children: Mutex<HashMap<String, Arc<Selection>>>,
}

impl Selection {
    /// Create a root node for an operation type.
    pub fn root(operation: OperationType) -> Arc<Self> {
        Self::root_with_alias_length(operation, DEFAULT_ALIAS_LENGTH)
    }

    /// Create a root node whose generated aliases use `alias_length` hash characters.
    pub fn root_with_alias_length(operation: OperationType, alias_length: usize) -> Arc<Self> {
        Self::new_root(operation.as_str(), alias_length)
    }

    /// Create a root node with an arbitrary key.
    ///
    /// Only roots named after an operation type can be compiled; anything else
    /// is rejected by the query builder.
    pub fn new_root(key: &str, alias_length: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SELECTION_ID.fetch_add(1, Ordering::Relaxed),
            key: SelectionKey::Field(key.to_string()),
            alias: None,
            input: None,
            is_union: false,
            alias_length,
            parent: None,
            children: Mutex::new(HashMap::new()),
        })
    }

    /// Get the existing child for `(key, alias-or-input)` or create it.
    pub fn get_child(self: &Arc<Self>, key: impl Into<SelectionKey>, options: ChildOptions) -> Arc<Self> {
        let key = key.into();
        let input = options.input.filter(|input| !input.is_empty());
        let alias = match (options.alias, &input) {
            (Some(alias), _) => Some(alias),
            (None, Some(input)) => Some(generate_alias(&key, input, self.alias_length)),
            (None, None) => None,
        };
        let child_key = alias.clone().unwrap_or_else(|| key.to_string());

        let mut children = self.children.lock();
        if let Some(existing) = children.get(&child_key) {
            return Arc::clone(existing);
        }

        let child = Arc::new(Self {
            id: NEXT_SELECTION_ID.fetch_add(1, Ordering::Relaxed),
            key,
            alias,
            input,
            is_union: options.is_union,
            alias_length: self.alias_length,
            parent: Some(Arc::clone(self)),
            children: Mutex::new(HashMap::new()),
        });
        children.insert(child_key, Arc::clone(&child));
        child
    }

    /// Forget every memoized descendant.
    ///
    /// Nodes held elsewhere stay valid, but `get_child` creates fresh nodes
    /// from here on.
    pub fn prune(&self) {
        let mut pending: Vec<Arc<Selection>> = self.children.lock().drain().map(|(_, c)| c).collect();
        while let Some(node) = pending.pop() {
            pending.extend(node.children.lock().drain().map(|(_, c)| c));
        }
    }

    /// Number of memoized direct children.
    pub fn child_count(&self) -> usize {
        self.children.lock().len()
    }

    /// Unique id of this node, stable for its lifetime.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &SelectionKey {
        &self.key
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn input(&self) -> Option<&SelectionInput> {
        self.input.as_ref()
    }

    pub fn is_union(&self) -> bool {
        self.is_union
    }

    pub fn parent(&self) -> Option<&Arc<Selection>> {
        self.parent.as_ref()
    }

    /// Alias when present, otherwise the key.
    pub fn alias_or_key(&self) -> String {
        self.alias.clone().unwrap_or_else(|| self.key.to_string())
    }

    /// Whether this is the synthetic `$on` node.
    pub fn is_union_marker(&self) -> bool {
        matches!(&self.key, SelectionKey::Field(name) if name == UNION_MARKER)
    }

    /// Operation type of the root of this tree, if the root is one.
    pub fn operation(&self) -> Option<OperationType> {
        let mut node = self;
        while let Some(parent) = node.parent.as_deref() {
            node = parent;
        }
        node.key.to_string().parse().ok()
    }

    /// Nodes from the root down to and including this one.
    pub fn ancestry(self: &Arc<Self>) -> Vec<Arc<Selection>> {
        let mut nodes = vec![Arc::clone(self)];
        let mut current = self.parent.clone();
        while let Some(node) = current {
            current = node.parent.clone();
            nodes.push(node);
        }
        nodes.reverse();
        nodes
    }

    /// Cache path segments: ancestor aliases/keys, skipping array indices,
    /// the `$on` node and union branches.
    pub fn cache_keys(self: &Arc<Self>) -> Vec<String> {
        self.ancestry()
            .iter()
            .filter(|node| !node.key.is_index() && !node.is_union_marker() && !node.is_union)
            .map(|node| node.alias_or_key())
            .collect()
    }

    /// Ancestry rendered as alias-or-key joined by dots, including indices.
    /// Unique among live nodes; used to order selections deterministically.
    pub fn signature(self: &Arc<Self>) -> String {
        self.ancestry()
            .iter()
            .map(|node| node.alias_or_key())
            .collect::<Vec<_>>()
            .join(".")
    }
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("alias", &self.alias)
            .field("is_union", &self.is_union)
            .finish()
    }
}

fn generate_alias(key: &SelectionKey, input: &SelectionInput, len: usize) -> String {
    let values: BTreeMap<&String, &Value> = input.iter().map(|(k, a)| (k, &a.value)).collect();
    let values = serde_json::to_value(values).unwrap_or(Value::Null);
    let key = key.to_string();
    format!("{}_{}", key, short_hash(&[&key, &canonical_json(&values)], len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id_input(value: Value) -> SelectionInput {
        let mut input = SelectionInput::new();
        input.insert("id".to_string(), Argument::new("ID!", value));
        input
    }

    #[test]
    fn test_get_child_is_idempotent() {
        let root = Selection::root(OperationType::Query);
        let a = root.get_child("a", ChildOptions::default());
        let b = root.get_child("a", ChildOptions::default());
        assert!(Arc::ptr_eq(&a, &b));

        let with_args = root.get_child("user", ChildOptions::with_input(id_input(json!(1))));
        let again = root.get_child("user", ChildOptions::with_input(id_input(json!(1))));
        assert!(Arc::ptr_eq(&with_args, &again));
    }

    #[test]
    fn test_different_arguments_yield_different_nodes() {
        let root = Selection::root(OperationType::Query);
        let one = root.get_child("user", ChildOptions::with_input(id_input(json!(1))));
        let two = root.get_child("user", ChildOptions::with_input(id_input(json!(2))));
        assert!(!Arc::ptr_eq(&one, &two));
        assert_ne!(one.alias(), two.alias());
    }

    #[test]
    fn test_alias_format() {
        let root = Selection::root(OperationType::Query);
        let user = root.get_child("user", ChildOptions::with_input(id_input(json!(1))));
        let alias = user.alias().unwrap();
        assert!(alias.starts_with("user_"));
        assert_eq!(alias.len(), "user_".len() + DEFAULT_ALIAS_LENGTH);

        let long = Selection::root_with_alias_length(OperationType::Query, 10);
        let user = long.get_child("user", ChildOptions::with_input(id_input(json!(1))));
        assert_eq!(user.alias().unwrap().len(), "user_".len() + 10);
    }

    #[test]
    fn test_explicit_alias_wins() {
        let root = Selection::root(OperationType::Query);
        let child = root.get_child(
            "user",
            ChildOptions {
                alias: Some("me".to_string()),
                input: Some(id_input(json!(1))),
                is_union: false,
            },
        );
        assert_eq!(child.alias_or_key(), "me");
    }

    #[test]
    fn test_cache_keys_skip_index_and_union_nodes() {
        let root = Selection::root(OperationType::Query);
        let items = root.get_child("items", ChildOptions::default());
        let first = items.get_child(0usize, ChildOptions::default());
        let on = first.get_child(UNION_MARKER, ChildOptions::default());
        let branch = on.get_child("Book", ChildOptions::union_branch());
        let title = branch.get_child("title", ChildOptions::default());

        assert_eq!(title.cache_keys(), vec!["query", "items", "title"]);
        assert_eq!(title.signature(), "query.items.0.$on.Book.title");
        assert_eq!(title.operation(), Some(OperationType::Query));
    }

    #[test]
    fn test_children_survive_dropped_handles() {
        let root = Selection::root(OperationType::Query);
        let first_id = root.get_child("a", ChildOptions::default()).id();
        let second_id = root.get_child("a", ChildOptions::default()).id();
        assert_eq!(first_id, second_id);

        let deep = root
            .get_child("a", ChildOptions::default())
            .get_child("b", ChildOptions::default())
            .id();
        let again = root
            .get_child("a", ChildOptions::default())
            .get_child("b", ChildOptions::default())
            .id();
        assert_eq!(deep, again);
        root.prune();
    }

    #[test]
    fn test_prune_forgets_descendants() {
        let root = Selection::root(OperationType::Query);
        let held = root
            .get_child("a", ChildOptions::default())
            .get_child("b", ChildOptions::default());
        assert_eq!(root.child_count(), 1);

        root.prune();
        assert_eq!(root.child_count(), 0);
        assert_eq!(held.cache_keys(), vec!["query", "a", "b"]);
        let fresh = root
            .get_child("a", ChildOptions::default())
            .get_child("b", ChildOptions::default());
        assert_ne!(fresh.id(), held.id());
    }

    #[test]
    fn test_child_keeps_parent_alive() {
        let leaf = {
            let root = Selection::root(OperationType::Mutation);
            root.get_child("a", ChildOptions::default())
                .get_child("b", ChildOptions::default())
        };
        assert_eq!(leaf.cache_keys(), vec!["mutation", "a", "b"]);
    }

    #[test]
    fn test_operation_type_parse() {
        assert_eq!("query".parse::<OperationType>(), Ok(OperationType::Query));
        assert!("Query".parse::<OperationType>().is_err());
        assert_eq!(OperationType::Subscription.to_string(), "subscription");
    }
}
