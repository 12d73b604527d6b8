//! Typed accessors over the cache.
//!
//! Reading a field through an [`Accessor`] selects it in the current
//! [`ResolutionContext`] and returns whatever the cache holds for it. Missing
//! objects and lists come back as accessors over a seeded placeholder so the
//! caller can keep walking (and selecting) deeper fields before any data
//! arrives.

mod array;
mod context;
mod union;

pub use array::ArrayAccessor;
pub use context::{ResolutionContext, SelectHook};
pub use union::UnionAccessor;

pub(crate) use context::Roots;

use crate::cache::CachePath;
use crate::error::ValidationError;
use crate::schema::TypeRef;
use crate::selection::{Argument, ChildOptions, OperationType, Selection, SelectionInput};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Value of a field read.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// Leaf value; `None` when missing or null
    Scalar(Option<Value>),
    /// `None` when the field is null
    Object(Option<Accessor>),
    List(Option<ArrayAccessor>),
    Union(Option<UnionAccessor>),
}

impl FieldValue {
    pub fn into_scalar(self) -> Option<Value> {
        match self {
            Self::Scalar(value) => value,
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<Accessor> {
        match self {
            Self::Object(accessor) => accessor,
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<ArrayAccessor> {
        match self {
            Self::List(accessor) => accessor,
            _ => None,
        }
    }

    pub fn into_union(self) -> Option<UnionAccessor> {
        match self {
            Self::Union(accessor) => accessor,
            _ => None,
        }
    }

    /// Whether the field resolved to null (or, for scalars, is not cached).
    pub fn is_null(&self) -> bool {
        match self {
            Self::Scalar(v) => v.is_none(),
            Self::Object(v) => v.is_none(),
            Self::List(v) => v.is_none(),
            Self::Union(v) => v.is_none(),
        }
    }
}

pub(crate) struct AccessorInner {
    context: ResolutionContext,
    selection: Arc<Selection>,
    type_name: String,
    operation: OperationType,
    /// `None` at operation roots
    path: Option<CachePath>,
    /// Selects fields without reading or seeding the cache
    placeholder: bool,
}

/// Accessor over one object in the cache.
///
/// Clones share identity; use [`Accessor::ptr_eq`] to check whether two reads
/// yielded the same memoized accessor.
#[derive(Clone)]
pub struct Accessor {
    inner: Arc<AccessorInner>,
}

impl fmt::Debug for Accessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("type_name", &self.inner.type_name)
            .field("path", &self.inner.path)
            .field("placeholder", &self.inner.placeholder)
            .finish()
    }
}

impl Accessor {
    fn new(inner: AccessorInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn selection(&self) -> &Arc<Selection> {
        &self.inner.selection
    }

    pub fn path(&self) -> Option<&CachePath> {
        self.inner.path.as_ref()
    }

    pub fn is_placeholder(&self) -> bool {
        self.inner.placeholder
    }

    pub fn ptr_eq(&self, other: &Accessor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read a field without arguments.
    pub fn field(&self, name: &str) -> Result<FieldValue, ValidationError> {
        self.field_with_args(name, Map::new())
    }

    /// Read a field with arguments.
    pub fn field_with_args(&self, name: &str, args: Map<String, Value>) -> Result<FieldValue, ValidationError> {
        let (child, type_ref) = self.child(name, &args)?;
        let path = self.child_path(&child);
        Ok(self.inner.context.resolve(
            child,
            type_ref,
            path,
            self.inner.operation,
            self.inner.placeholder,
        ))
    }

    /// Shorthand for a scalar field.
    pub fn scalar(&self, name: &str) -> Result<Option<Value>, ValidationError> {
        Ok(self.field(name)?.into_scalar())
    }

    /// Shorthand for an object field.
    pub fn object(&self, name: &str) -> Result<Option<Accessor>, ValidationError> {
        Ok(self.field(name)?.into_object())
    }

    /// Shorthand for a list field.
    pub fn list(&self, name: &str) -> Result<Option<ArrayAccessor>, ValidationError> {
        Ok(self.field(name)?.into_list())
    }

    /// Write a field without arguments.
    pub fn set(&self, name: &str, value: Value) -> Result<(), ValidationError> {
        self.set_with_args(name, Map::new(), value)
    }

    /// Write a field through to the cache.
    ///
    /// On a normalized object the write lands in the shared object, so every
    /// path referencing it observes the new value.
    pub fn set_with_args(
        &self,
        name: &str,
        args: Map<String, Value>,
        value: Value,
    ) -> Result<(), ValidationError> {
        let (child, _) = self.child(name, &args)?;
        let path = self.child_path(&child);
        if self.inner.placeholder || !self.inner.context.cache().write(&path, value) {
            return Err(ValidationError::malformed_path(
                path.to_string(),
                "parent object is not in the cache",
            ));
        }
        self.inner.context.forget(&child, &path);
        self.inner.context.replay(&child);
        Ok(())
    }

    /// Validate a field and its arguments, returning its selection.
    fn child(&self, name: &str, args: &Map<String, Value>) -> Result<(Arc<Selection>, TypeRef), ValidationError> {
        let schema = self.inner.context.schema();
        let def = schema.require_field(&self.inner.type_name, name)?;

        let mut input = SelectionInput::new();
        for (arg, value) in args {
            let type_name = def
                .args
                .get(arg)
                .ok_or_else(|| ValidationError::unknown_argument(name, arg.as_str()))?;
            input.insert(arg.clone(), Argument::new(type_name.as_str(), value.clone()));
        }

        let child = self
            .inner
            .selection
            .get_child(name, ChildOptions::with_input(input));
        Ok((child, def.parsed_type()))
    }

    fn child_path(&self, child: &Selection) -> CachePath {
        match &self.inner.path {
            Some(path) => path.child(child.alias_or_key()),
            None => CachePath::new(self.inner.operation, child.alias_or_key()),
        }
    }
}
