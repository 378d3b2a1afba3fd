/// Index-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate key {key} for unique index {index}")]
    DuplicateKey { index: String, key: String },

    #[error("stale write to {key}: stored version {stored}, attempted {attempted}")]
    StaleWrite {
        key: String,
        stored: u64,
        attempted: u64,
    },

    #[error("index {0} already exists with different fields")]
    IndexMismatch(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
