//! Shared, read-mostly view of the constraint catalog.

use std::sync::Arc;
use tokio::sync::RwLock;

use attest_core::{IndexConstraint, SchemaLayout};

#[derive(Debug, Default)]
struct SchemaState {
    constraints: Vec<IndexConstraint>,
    layout: SchemaLayout,
}

/// Handle to the current constraint catalog and the layout derived from it.
///
/// Only the migration guard replaces the catalog; the reconciler and the
/// verifier read it.
#[derive(Debug, Clone, Default)]
pub struct SchemaHandle {
    state: Arc<RwLock<SchemaState>>,
}

impl SchemaHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The document layout writes and reads must use right now.
    pub async fn layout(&self) -> SchemaLayout {
        self.state.read().await.layout.clone()
    }

    /// The catalog entry for a physical index name.
    pub async fn constraint(&self, index_name: &str) -> Option<IndexConstraint> {
        self.state
            .read()
            .await
            .constraints
            .iter()
            .find(|c| c.name == index_name)
            .cloned()
    }

    pub async fn constraints(&self) -> Vec<IndexConstraint> {
        self.state.read().await.constraints.clone()
    }

    pub(crate) async fn replace(&self, constraints: Vec<IndexConstraint>) {
        let layout = SchemaLayout::from_constraints(&constraints);
        let mut state = self.state.write().await;
        if state.layout != layout {
            tracing::info!(id_fields = ?layout.id_fields, token_field = %layout.token_field, "document layout changed");
        }
        state.constraints = constraints;
        state.layout = layout;
    }
}
