use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// A stored document: a JSON object.
pub type Document = serde_json::Map<String, Value>;

/// Documents carrying this field are version-checked on upsert.
pub const VERSION_FIELD: &str = "cache_version";

/// Physical definition of a unique index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Index key of a document. A missing field indexes as `null`, so two
    /// documents that both lack an indexed field collide.
    pub fn key_for(&self, doc: &Document) -> String {
        let values: Vec<&Value> = self
            .fields
            .iter()
            .map(|f| doc.get(f).unwrap_or(&Value::Null))
            .collect();
        serde_json::to_string(&values).unwrap_or_default()
    }
}

/// Version carried by a document, if any.
pub fn version_of(doc: &Document) -> Option<u64> {
    doc.get(VERSION_FIELD).and_then(Value::as_u64)
}

/// Reject a write whose version does not advance past the stored one.
pub fn check_version(
    key: &str,
    stored: Option<&Document>,
    incoming: &Document,
) -> Result<(), StoreError> {
    let (Some(stored), Some(attempted)) = (stored.and_then(version_of), version_of(incoming))
    else {
        return Ok(());
    };
    if attempted <= stored {
        return Err(StoreError::StaleWrite {
            key: key.to_string(),
            stored,
            attempted,
        });
    }
    Ok(())
}
