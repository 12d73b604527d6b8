//! List accessors.

use super::{FieldValue, ResolutionContext};
use crate::cache::CachePath;
use crate::error::ValidationError;
use crate::schema::TypeRef;
use crate::selection::{ChildOptions, OperationType, Selection};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Accessor over a list field.
#[derive(Clone)]
pub struct ArrayAccessor {
    context: ResolutionContext,
    selection: Arc<Selection>,
    item_type: TypeRef,
    operation: OperationType,
    path: CachePath,
    placeholder: bool,
}

impl fmt::Debug for ArrayAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayAccessor")
            .field("path", &self.path)
            .field("item_type", &self.item_type)
            .field("placeholder", &self.placeholder)
            .finish()
    }
}

impl ArrayAccessor {
    pub(crate) fn new(
        context: ResolutionContext,
        selection: Arc<Selection>,
        item_type: TypeRef,
        operation: OperationType,
        path: CachePath,
        placeholder: bool,
    ) -> Self {
        Self {
            context,
            selection,
            item_type,
            operation,
            path,
            placeholder,
        }
    }

    pub fn path(&self) -> &CachePath {
        &self.path
    }

    /// Number of cached elements. Selects the element fields via index 0.
    pub fn len(&self) -> usize {
        self.touch(0);
        self.cached_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at `index`.
    ///
    /// Past the end yields `None`, except index 0 of an empty list, which
    /// yields a placeholder so element fields can still be selected.
    pub fn get(&self, index: usize) -> Option<FieldValue> {
        let len = self.cached_len();
        let placeholder = if index < len {
            self.placeholder
        } else if index == 0 {
            true
        } else {
            return None;
        };
        let item = self.selection.get_child(index, ChildOptions::default());
        Some(self.context.resolve(
            item,
            self.item_type.clone(),
            self.path.child(index.to_string()),
            self.operation,
            placeholder,
        ))
    }

    /// Element lookup by string key. Only numeric keys address elements.
    pub fn by_key(&self, key: &str) -> Option<FieldValue> {
        match key.parse::<usize>() {
            Ok(index) => self.get(index),
            Err(_) => {
                warn!("Non-numeric key '{}' used on list {}", key, self.path);
                None
            }
        }
    }

    /// Iterate over the cached elements.
    pub fn iter(&self) -> impl Iterator<Item = FieldValue> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Replace or append the element at `index`.
    pub fn set(&self, index: usize, value: Value) -> Result<(), ValidationError> {
        let len = self.cached_len();
        let path = self.path.child(index.to_string());
        if index > len || self.placeholder || !self.context.cache().write(&path, value) {
            return Err(ValidationError::InvalidArrayAssignment { index, len });
        }
        let item = self.selection.get_child(index, ChildOptions::default());
        self.context.forget(&item, &path);
        self.context.replay(&item);
        Ok(())
    }

    /// Select element `index` without reading it.
    pub(crate) fn touch(&self, index: usize) {
        let item = self.selection.get_child(index, ChildOptions::default());
        self.context.register(&item, &self.item_type);
    }

    fn cached_len(&self) -> usize {
        if self.placeholder {
            return 0;
        }
        match self.context.cache().read(&self.path).value {
            Some(Value::Array(items)) => items.len(),
            _ => 0,
        }
    }
}
