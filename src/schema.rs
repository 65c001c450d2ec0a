//! Runtime-type validation for inserted values.

use crate::error::{Result, StoreError};
use crate::types::{TypeTag, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The kind of value a schema entry accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Int,
    Float,
    Str,
    List,
    Tuple,
    /// Int or float.
    Number,
    /// List or tuple.
    Sequence,
    Any,
}

impl ValueKind {
    /// Whether `value` is an instance of this kind.
    pub fn admits(self, value: &Value) -> bool {
        match (self, value) {
            (ValueKind::Any, _) => true,
            (ValueKind::Int, Value::Int(_)) => true,
            (ValueKind::Float, Value::Float(_)) => true,
            (ValueKind::Str, Value::Str(_)) => true,
            (ValueKind::List, Value::List(_)) => true,
            (ValueKind::Tuple, Value::Tuple(_)) => true,
            (ValueKind::Number, Value::Int(_) | Value::Float(_)) => true,
            (ValueKind::Sequence, Value::List(_) | Value::Tuple(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Int => "int",
            ValueKind::Float => "float",
            ValueKind::Str => "string",
            ValueKind::List => "list",
            ValueKind::Tuple => "tuple",
            ValueKind::Number => "number",
            ValueKind::Sequence => "sequence",
            ValueKind::Any => "any",
        };
        f.write_str(name)
    }
}

/// Mapping from type tag to the kind its values must have.
///
/// Tags with no entry accept any value carrying that tag.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    entries: BTreeMap<TypeTag, ValueKind>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the kind required for values tagged `tag`.
    pub fn with(mut self, tag: TypeTag, kind: ValueKind) -> Self {
        self.entries.insert(tag, kind);
        self
    }

    pub fn expected(&self, tag: TypeTag) -> Option<ValueKind> {
        self.entries.get(&tag).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Check a value against its tag's entry.
    pub fn validate(&self, value: &Value) -> Result<()> {
        let tag = value.type_tag();
        match self.expected(tag) {
            Some(kind) if !kind.admits(value) => Err(StoreError::SchemaViolation {
                tag,
                expected: kind.to_string(),
            }),
            _ => Ok(()),
        }
    }
}
