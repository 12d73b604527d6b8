//! Query compiler.
//!
//! Turns a set of selections into GraphQL documents. Ancestries are grouped by
//! root operation (all queries together, all mutations together, one document
//! per top-level subscription field), merged into a field tree keyed by the
//! rendered field head and serialized depth-first with siblings in
//! lexicographic order, so the same selection set always yields the same text
//! and hash.

use crate::error::ValidationError;
use crate::hash::{canonical_json, sha256_hex, short_hash};
use crate::selection::{OperationType, Selection, SelectionKey};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, trace};

/// Default number of memoized compiled documents.
pub const DEFAULT_DOCUMENT_CACHE_SIZE: usize = 256;

/// Hash length used in variable names.
const VARIABLE_HASH_LENGTH: usize = 6;

/// Options for [`QueryBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub operation_name: Option<String>,
}

/// One compiled GraphQL operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledDocument {
    pub query: String,
    pub variables: Option<Map<String, Value>>,
    pub operation_name: Option<String>,
    pub operation: OperationType,
    /// sha256 of the query text and its canonical variables
    pub hash: String,
}

/// Compiles selection sets into documents, memoizing results in an LRU.
pub struct QueryBuilder {
    documents: Mutex<LruCache<String, Vec<CompiledDocument>>>,
}

impl Default for QueryBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_DOCUMENT_CACHE_SIZE)
    }
}

impl QueryBuilder {
    /// Create a builder memoizing up to `capacity` selection sets.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            documents: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of memoized selection sets.
    pub fn cached_documents(&self) -> usize {
        self.documents.lock().len()
    }

    /// Compile `selections` into one document per operation group.
    ///
    /// Returns an empty list when nothing below a root was selected.
    pub fn build(
        &self,
        selections: &[Arc<Selection>],
        options: &BuildOptions,
    ) -> Result<Vec<CompiledDocument>, ValidationError> {
        let mut ancestries: Vec<(String, Vec<Arc<Selection>>)> = selections
            .iter()
            .map(|s| (s.signature(), s.ancestry()))
            .collect();
        ancestries.sort_by(|a, b| a.0.cmp(&b.0));
        ancestries.dedup_by(|a, b| a.0 == b.0);

        let memo_key = format!(
            "{}|{}",
            options.operation_name.as_deref().unwrap_or(""),
            ancestries
                .iter()
                .map(|(_, a)| a.last().map(|s| s.id()).unwrap_or_default().to_string())
                .collect::<Vec<_>>()
                .join(",")
        );
        if let Some(docs) = self.documents.lock().get(&memo_key) {
            trace!("Document cache hit for {} selections", ancestries.len());
            return Ok(docs.clone());
        }

        let mut groups: BTreeMap<(OperationType, String), Vec<&[Arc<Selection>]>> = BTreeMap::new();
        for (_, ancestry) in &ancestries {
            let Some(root) = ancestry.first() else {
                continue;
            };
            let operation = root
                .key()
                .to_string()
                .parse::<OperationType>()
                .map_err(|_| ValidationError::InconsistentRoot(root.key().to_string()))?;
            if ancestry.len() < 2 {
                continue;
            }
            let group = match operation {
                OperationType::Subscription => ancestry[1].alias_or_key(),
                _ => String::new(),
            };
            groups
                .entry((operation, group))
                .or_default()
                .push(&ancestry[1..]);
        }

        let mut documents = Vec::with_capacity(groups.len());
        for ((operation, _), paths) in groups {
            let mut tree = FieldTree::default();
            let mut variables = Variables::default();
            for path in paths {
                tree.insert(path, &mut variables);
            }
            if tree.children.is_empty() {
                continue;
            }
            documents.push(compile(operation, &tree, variables, options));
        }

        debug!(
            "Compiled {} selections into {} documents",
            ancestries.len(),
            documents.len()
        );
        self.documents.lock().put(memo_key, documents.clone());
        Ok(documents)
    }
}

/// Nested field tree keyed by rendered field head.
#[derive(Default)]
struct FieldTree {
    children: BTreeMap<String, FieldTree>,
}

impl FieldTree {
    fn insert(&mut self, path: &[Arc<Selection>], variables: &mut Variables) {
        let mut node = self;
        for selection in path {
            let head = match selection.key() {
                SelectionKey::Index(_) => continue,
                _ if selection.is_union_marker() => continue,
                SelectionKey::Field(name) if selection.is_union() => format!("...on {}", name),
                SelectionKey::Field(name) => render_field(selection, name, variables),
            };
            node = node.children.entry(head).or_default();
        }
    }

    fn render(&self, out: &mut String) {
        for (i, (head, child)) in self.children.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(head);
            if !child.children.is_empty() {
                out.push('{');
                child.render(out);
                out.push('}');
            }
        }
    }
}

fn render_field(selection: &Selection, name: &str, variables: &mut Variables) -> String {
    let mut head = String::new();
    if let Some(alias) = selection.alias() {
        head.push_str(alias);
        head.push(':');
    }
    head.push_str(name);

    if let Some(input) = selection.input() {
        let owner = selection.alias_or_key();
        let args = input
            .iter()
            .map(|(arg, value)| {
                let var = variables.declare(&owner, arg, &value.type_name, &value.value);
                format!("{}:${}", arg, var)
            })
            .collect::<Vec<_>>()
            .join(",");
        head.push('(');
        head.push_str(&args);
        head.push(')');
    }
    head
}

/// Declared variables: name → (type, value).
#[derive(Default)]
struct Variables {
    declared: BTreeMap<String, (String, Value)>,
}

impl Variables {
    /// Declare a variable for `(type, value)`, reusing an equal declaration.
    fn declare(&mut self, field: &str, arg: &str, type_name: &str, value: &Value) -> String {
        if let Some((name, _)) = self
            .declared
            .iter()
            .find(|(_, (t, v))| t == type_name && v == value)
        {
            return name.clone();
        }

        let base = format!("{}_{}", arg, short_hash(&[field, arg], VARIABLE_HASH_LENGTH));
        let mut name = base.clone();
        let mut suffix = 2;
        while self.declared.contains_key(&name) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        self.declared
            .insert(name.clone(), (type_name.to_string(), value.clone()));
        name
    }
}

fn compile(
    operation: OperationType,
    tree: &FieldTree,
    variables: Variables,
    options: &BuildOptions,
) -> CompiledDocument {
    let mut query = String::from(operation.as_str());
    if let Some(name) = &options.operation_name {
        query.push(' ');
        query.push_str(name);
    }
    if !variables.declared.is_empty() {
        let header = variables
            .declared
            .iter()
            .map(|(name, (type_name, _))| format!("${}:{}", name, type_name))
            .collect::<Vec<_>>()
            .join(",");
        query.push('(');
        query.push_str(&header);
        query.push(')');
    }
    query.push('{');
    tree.render(&mut query);
    query.push('}');

    let variables: Option<Map<String, Value>> = if variables.declared.is_empty() {
        None
    } else {
        Some(
            variables
                .declared
                .into_iter()
                .map(|(name, (_, value))| (name, value))
                .collect(),
        )
    };
    let vars_json = variables
        .as_ref()
        .map(|v| canonical_json(&Value::Object(v.clone())))
        .unwrap_or_default();
    let hash = sha256_hex(&[&query, &vars_json]);

    CompiledDocument {
        query,
        variables,
        operation_name: options.operation_name.clone(),
        operation,
        hash,
    }
}
