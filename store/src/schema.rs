//! Document shape helpers: reconciliation against a schema default and the
//! shallow merge used by saves.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::record::RecordKind;

/// A structured per-client record. Only top-level keys are significant to
/// reconciliation and merging.
pub type Document = Map<String, Value>;

/// Fill every top-level key of `template` that is missing from `doc`.
///
/// Present keys are never touched, even when their value has a different
/// type from the template's. Returns how many keys were added.
pub fn reconcile(doc: &mut Document, template: &Document) -> usize {
    let mut added = 0;
    for (key, default) in template {
        if !doc.contains_key(key) {
            doc.insert(key.clone(), default.clone());
            added += 1;
        }
    }
    added
}

/// Shallow merge: keys in `patch` overwrite, all other keys persist.
pub fn merge_patch(doc: &mut Document, patch: Document) {
    for (key, value) in patch {
        doc.insert(key, value);
    }
}

/// The client-visible working representation of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordValue {
    Document(Document),
    Number(i64),
}

impl RecordValue {
    pub fn kind(&self) -> RecordKind {
        match self {
            RecordValue::Document(_) => RecordKind::Document,
            RecordValue::Number(_) => RecordKind::SortedNumeric,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            RecordValue::Document(doc) => Some(doc),
            RecordValue::Number(_) => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            RecordValue::Number(n) => Some(*n),
            RecordValue::Document(_) => None,
        }
    }
}

/// Validate a JSON value destined for a sorted store.
///
/// Sorted stores hold integers; anything else is caller misuse.
pub fn number_from_json(value: &Value) -> Result<i64, StoreError> {
    match value {
        Value::Number(n) => n.as_i64().ok_or_else(|| {
            StoreError::usage(format!("sorted values must be integers, got {}", n))
        }),
        other => Err(StoreError::usage(format!(
            "sorted values must be numeric, got {}",
            other
        ))),
    }
}
