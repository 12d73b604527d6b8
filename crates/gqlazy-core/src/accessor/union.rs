//! Union and interface accessors.

use super::{Accessor, ResolutionContext};
use crate::cache::CachePath;
use crate::error::ValidationError;
use crate::selection::{ChildOptions, OperationType, Selection, UNION_MARKER};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Accessor over a field of abstract type.
///
/// Concrete branches are reached through [`UnionAccessor::on`]; only the
/// branch matching the cached `__typename` yields data.
#[derive(Clone)]
pub struct UnionAccessor {
    context: ResolutionContext,
    selection: Arc<Selection>,
    type_name: String,
    operation: OperationType,
    path: CachePath,
    placeholder: bool,
}

impl fmt::Debug for UnionAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnionAccessor")
            .field("type_name", &self.type_name)
            .field("path", &self.path)
            .finish()
    }
}

impl UnionAccessor {
    pub(crate) fn new(
        context: ResolutionContext,
        selection: Arc<Selection>,
        type_name: String,
        operation: OperationType,
        path: CachePath,
        placeholder: bool,
    ) -> Self {
        Self {
            context,
            selection,
            type_name,
            operation,
            path,
            placeholder,
        }
    }

    /// The abstract type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn path(&self) -> &CachePath {
        &self.path
    }

    pub fn possible_types(&self) -> Vec<String> {
        self.context.schema().possible_types(&self.type_name).to_vec()
    }

    /// Cached concrete type, once known.
    pub fn typename(&self) -> Option<String> {
        if self.placeholder {
            return None;
        }
        match self.context.cache().read(&self.path).value {
            Some(Value::Object(object)) => object
                .get("__typename")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }

    /// Branch accessor for `type_name`.
    ///
    /// `None` when the cached type is known and differs.
    pub fn on(&self, type_name: &str) -> Result<Option<Accessor>, ValidationError> {
        if !self
            .context
            .schema()
            .possible_types(&self.type_name)
            .iter()
            .any(|t| t == type_name)
        {
            return Err(ValidationError::UnknownType(type_name.to_string()));
        }
        if self.typename().is_some_and(|actual| actual != type_name) {
            return Ok(None);
        }

        let branch = self
            .selection
            .get_child(UNION_MARKER, ChildOptions::default())
            .get_child(type_name, ChildOptions::union_branch());
        self.context.select_identity(&branch, type_name, false);

        let data = if self.placeholder {
            None
        } else {
            Some(
                self.context
                    .cache()
                    .read(&self.path)
                    .value
                    .unwrap_or(Value::Null),
            )
        };
        Ok(Some(self.context.accessor(
            branch,
            type_name.to_string(),
            self.path.clone(),
            self.operation,
            data.as_ref(),
        )))
    }
}
