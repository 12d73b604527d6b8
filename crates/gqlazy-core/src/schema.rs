//! Schema model consumed by the accessors.
//!
//! The schema is the generated JSON shape: type name → field name →
//! `{ "__type": "[User!]!", "__args": { "id": "ID!" } }`, with root types
//! named `query`, `mutation` and `subscription`. Unions and interfaces list
//! their concrete members under `$on`, either as an array of type names or as
//! an object keyed by them:
//!
//! ```json
//! { "SearchResult": { "$on": ["Book", "Author"] },
//!   "Node": { "id": { "__type": "ID!" }, "$on": { "User": {}, "Team": {} } } }
//! ```

use crate::error::ValidationError;
use crate::selection::UNION_MARKER;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Built-in scalar type names.
const BUILTIN_SCALARS: &[&str] = &["String", "Int", "Float", "Boolean", "ID"];

/// A field declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "__type")]
    pub type_ref: String,

    #[serde(rename = "__args", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
}

impl FieldDef {
    pub fn new(type_ref: impl Into<String>) -> Self {
        Self {
            type_ref: type_ref.into(),
            args: BTreeMap::new(),
        }
    }

    pub fn with_arg(mut self, name: impl Into<String>, type_ref: impl Into<String>) -> Self {
        self.args.insert(name.into(), type_ref.into());
        self
    }

    /// Parsed field type.
    pub fn parsed_type(&self) -> TypeRef {
        TypeRef::parse(&self.type_ref)
    }
}

/// A parsed GraphQL type reference such as `[User!]!`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeRef {
    /// Named type without list or non-null wrappers
    pub name: String,
    /// Number of list wrappers
    pub list_depth: usize,
    /// Whether the outermost wrapper is nullable
    pub nullable: bool,
}

impl TypeRef {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let nullable = !raw.ends_with('!');
        let list_depth = raw.chars().take_while(|c| *c == '[').count();
        let name = raw
            .trim_matches(|c| c == '[' || c == ']' || c == '!')
            .to_string();
        Self {
            name,
            list_depth,
            nullable,
        }
    }

    /// Element type of a list type.
    pub fn item(&self) -> Self {
        Self {
            name: self.name.clone(),
            list_depth: self.list_depth.saturating_sub(1),
            nullable: true,
        }
    }

    pub fn is_list(&self) -> bool {
        self.list_depth > 0
    }
}

fn member_names(type_name: &str, members: Value) -> Result<Vec<String>, ValidationError> {
    let names: Option<Vec<String>> = match members {
        Value::Array(items) => items
            .into_iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
        Value::Object(map) => Some(map.into_iter().map(|(name, _)| name).collect()),
        _ => None,
    };
    names.ok_or_else(|| {
        ValidationError::InvalidSchema(format!(
            "'{}' of '{}' must list type names",
            UNION_MARKER, type_name
        ))
    })
}

/// Kind of a named type, as far as the accessors care.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Scalar,
    Object,
    Abstract,
}

/// Types and their fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    types: HashMap<String, BTreeMap<String, FieldDef>>,
    possible_types: HashMap<String, Vec<String>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the generated-schema JSON shape.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(entries) = value else {
            return Err(ValidationError::InvalidSchema(
                "expected an object of types".to_string(),
            ));
        };

        let mut schema = Self::new();
        for (name, entry) in entries {
            let Value::Object(mut fields) = entry else {
                return Err(ValidationError::InvalidSchema(format!(
                    "type '{}' is not an object",
                    name
                )));
            };
            if let Some(members) = fields.remove(UNION_MARKER) {
                let members = member_names(&name, members)?;
                schema.possible_types.insert(name.clone(), members);
            }
            let fields: BTreeMap<String, FieldDef> = serde_json::from_value(Value::Object(fields))
                .map_err(|e| ValidationError::InvalidSchema(format!("type '{}': {}", name, e)))?;
            schema.types.insert(name, fields);
        }
        Ok(schema)
    }

    /// Parse a schema from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ValidationError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ValidationError::InvalidSchema(e.to_string()))?;
        Self::from_value(value)
    }

    /// Add or replace an object type.
    pub fn with_type<I, N>(mut self, name: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (N, FieldDef)>,
        N: Into<String>,
    {
        self.types.insert(
            name.into(),
            fields.into_iter().map(|(n, f)| (n.into(), f)).collect(),
        );
        self
    }

    /// Declare the concrete members of a union or interface.
    pub fn with_possible_types<I, N>(mut self, name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
    {
        self.possible_types
            .insert(name.into(), members.into_iter().map(Into::into).collect());
        self
    }

    pub fn field(&self, type_name: &str, field: &str) -> Option<&FieldDef> {
        self.types.get(type_name).and_then(|fields| fields.get(field))
    }

    /// Look up a field, failing with a validation error when absent.
    pub fn require_field(&self, type_name: &str, field: &str) -> Result<&FieldDef, ValidationError> {
        if field == "__typename" {
            return Ok(&TYPENAME_FIELD);
        }
        self.field(type_name, field)
            .ok_or_else(|| ValidationError::unknown_field(type_name, field))
    }

    pub fn has_type(&self, name: &str) -> bool {
        self.types.contains_key(name) || self.possible_types.contains_key(name)
    }

    pub fn kind(&self, name: &str) -> TypeKind {
        if self.possible_types.contains_key(name) {
            TypeKind::Abstract
        } else if self.types.contains_key(name) && !BUILTIN_SCALARS.contains(&name) {
            TypeKind::Object
        } else {
            TypeKind::Scalar
        }
    }

    pub fn possible_types(&self, name: &str) -> &[String] {
        self.possible_types
            .get(name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Identity fields from `candidates` that `type_name` declares.
    pub fn identity_fields<'a>(&self, type_name: &str, candidates: &'a [String]) -> Vec<&'a str> {
        candidates
            .iter()
            .filter(|f| self.field(type_name, f).is_some())
            .map(String::as_str)
            .collect()
    }
}

static TYPENAME_FIELD: std::sync::LazyLock<FieldDef> =
    std::sync::LazyLock::new(|| FieldDef::new("String!"));
