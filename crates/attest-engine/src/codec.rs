//! Mapping between [`Credential`] and stored documents under a layout.

use serde_json::Value;

use attest_core::{Credential, SchemaLayout};
use attest_store::Document;

use crate::error::EngineError;

const ID_KEY: &str = "id";
const TOKEN_KEY: &str = "verification_token";

/// Field names of the serialized credential; identifier fields may not reuse them.
pub const RESERVED_FIELDS: &[&str] = &[
    "id",
    "status",
    "issuance_tx",
    "revocation_tx",
    "document_hash",
    "verification_token",
    "cache_version",
    "failure_reason",
    "created_at",
    "updated_at",
];

/// Encode a credential, writing its identifier under every layout id field.
pub fn to_document(credential: &Credential, layout: &SchemaLayout) -> Result<Document, EngineError> {
    let Value::Object(mut doc) = serde_json::to_value(credential)? else {
        return Err(EngineError::Internal("credential did not encode as an object".into()));
    };

    doc.remove(ID_KEY);
    for field in &layout.id_fields {
        doc.insert(field.clone(), Value::String(credential.id.as_str().to_string()));
    }
    if layout.token_field != TOKEN_KEY {
        if let Some(token) = doc.remove(TOKEN_KEY) {
            doc.insert(layout.token_field.clone(), token);
        }
    }
    Ok(doc)
}

/// Decode a stored document. The identifier is taken from the first layout
/// id field present, then from any other, then from the store key.
pub fn from_document(
    key: &str,
    mut doc: Document,
    layout: &SchemaLayout,
) -> Result<Credential, EngineError> {
    let id = layout
        .id_fields
        .iter()
        .find_map(|f| doc.get(f).and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| key.to_string());
    doc.insert(ID_KEY.to_string(), Value::String(id));

    if layout.token_field != TOKEN_KEY {
        if let Some(token) = doc.remove(&layout.token_field) {
            doc.insert(TOKEN_KEY.to_string(), token);
        }
    }
    Ok(serde_json::from_value(Value::Object(doc))?)
}

/// Whether `field` may carry the identifier.
pub fn is_reserved(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}
