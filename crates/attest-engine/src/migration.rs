//! Schema migration guard: owns the unique-constraint lifecycle.
//!
//! A rename of the identifier field runs in three steps:
//!
//! 1. `begin_rename`: the new constraint joins the catalog as `active`, so
//!    the write path dual-writes both fields; existing documents are
//!    backfilled; the new index is created.
//! 2. `deprecate`: the old constraint becomes `deprecated` (still indexed,
//!    still written) and the backfill runs again.
//! 3. `finalize`: once no document relies on the old field alone, the old
//!    index is dropped and the constraint becomes `removed`.
//!
//! Every step can be re-run. This module is the only place unique indexes
//! are dropped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use attest_core::{
    ConstraintPurpose, ConstraintState, CredentialId, IndexConstraint, SchemaLayout,
};
use attest_store::{Document, IndexSpec, IndexStore, StoreError, VERSION_FIELD};

use crate::codec;
use crate::error::EngineError;
use crate::locks::KeyedLocks;
use crate::schema::SchemaHandle;

/// Snapshot of the constraint catalog against the physical indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub constraints: Vec<IndexConstraint>,
    pub layout: SchemaLayout,
    pub indexes: Vec<IndexSpec>,
    /// Physical indexes no live constraint accounts for.
    pub ghost_indexes: Vec<String>,
}

pub struct MigrationGuard {
    store: Arc<dyn IndexStore>,
    schema: SchemaHandle,
    /// Per-constraint exclusion for lifecycle steps.
    constraint_locks: KeyedLocks<String>,
    /// Shared with the reconciler; held while a document is backfilled.
    id_locks: Arc<KeyedLocks<CredentialId>>,
    /// Serializes catalog reloads into the schema handle.
    catalog: Mutex<()>,
}

impl MigrationGuard {
    pub fn new(
        store: Arc<dyn IndexStore>,
        schema: SchemaHandle,
        id_locks: Arc<KeyedLocks<CredentialId>>,
    ) -> Self {
        Self {
            store,
            schema,
            constraint_locks: KeyedLocks::new(),
            id_locks,
            catalog: Mutex::new(()),
        }
    }

    /// Seed an empty catalog, make the physical indexes match it and load
    /// it into the schema handle.
    pub async fn bootstrap(&self) -> Result<(), EngineError> {
        let mut constraints = self.store.list_constraints().await?;
        if constraints.is_empty() {
            for constraint in IndexConstraint::baseline() {
                self.store.put_constraint(&constraint).await?;
            }
            info!("seeded baseline unique constraints");
            constraints = self.store.list_constraints().await?;
        }

        let physical: Vec<String> = self
            .store
            .list_indexes()
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect();
        for constraint in &constraints {
            if constraint.is_live() {
                self.create_index(constraint).await?;
            } else if physical.contains(&constraint.name) {
                warn!(index = %constraint.name, "index of removed constraint still present, dropping");
                self.store.drop_index(&constraint.name).await?;
            }
        }

        self.refresh().await?;
        Ok(())
    }

    /// Start renaming identifier field `from` to `to`.
    pub async fn begin_rename(&self, from: &str, to: &str) -> Result<IndexConstraint, EngineError> {
        let (from, to) = (validate_field(from)?, validate_field(to)?);
        if from == to {
            return Err(EngineError::InvalidInput(
                "source and target field are the same".into(),
            ));
        }
        let old_name = IndexConstraint::name_for(&from);
        let new_name = IndexConstraint::name_for(&to);
        let _guards = self.lock_pair(&old_name, &new_name).await;

        let mut old = self.require(&old_name).await?;
        if old.purpose != ConstraintPurpose::Identifier {
            return Err(EngineError::InvalidInput(format!(
                "{} is not an identifier field",
                from
            )));
        }
        match (old.state, old.replaced_by.as_deref()) {
            (ConstraintState::Active, None) => {}
            (_, Some(target)) if target == new_name => {
                debug!(from = %from, to = %to, "rename already started, resuming");
            }
            (_, Some(target)) => {
                return Err(EngineError::Migration(format!(
                    "{} is already being replaced by {}",
                    old_name, target
                )))
            }
            (state, None) => {
                return Err(EngineError::Migration(format!(
                    "cannot rename a {} constraint",
                    state
                )))
            }
        }

        let new = match self.find(&new_name).await? {
            Some(existing) if existing.is_live() && existing.purpose == ConstraintPurpose::Identifier => {
                existing
            }
            Some(existing) => {
                return Err(EngineError::Migration(format!(
                    "field {} belongs to a {} constraint",
                    to, existing.state
                )))
            }
            None => {
                let created = IndexConstraint::single(&to, ConstraintPurpose::Identifier);
                self.store.put_constraint(&created).await?;
                created
            }
        };
        // From here on every write carries both fields.
        self.refresh().await?;

        let backfilled = self.backfill(&from, &to).await?;
        self.create_index(&new).await?;

        if old.replaced_by.is_none() {
            old.replaced_by = Some(new_name.clone());
            old.updated_at = chrono::Utc::now();
            self.store.put_constraint(&old).await?;
            self.refresh().await?;
        }
        info!(from = %from, to = %to, backfilled, "rename begun, dual-writing");
        Ok(new)
    }

    /// Mark the constraint on `field` deprecated and backfill again.
    pub async fn deprecate(&self, field: &str) -> Result<IndexConstraint, EngineError> {
        let field = validate_field(field)?;
        let name = IndexConstraint::name_for(&field);
        let _guard = self.constraint_locks.lock(&name).await;

        let mut constraint = self.require(&name).await?;
        if constraint.state == ConstraintState::Removed {
            debug!(index = %name, "constraint already removed");
            return Ok(constraint);
        }
        let replacement = self.replacement_of(&constraint).await?;

        let changed = constraint
            .advance(ConstraintState::Deprecated)
            .map_err(|e| EngineError::Migration(e.to_string()))?;
        if changed {
            self.store.put_constraint(&constraint).await?;
            self.refresh().await?;
        }
        let backfilled = self.backfill(&field, replacement.field()).await?;
        info!(index = %name, backfilled, "constraint deprecated");
        Ok(constraint)
    }

    /// Drop the index of a deprecated constraint once nothing relies on it.
    pub async fn finalize(&self, field: &str) -> Result<IndexConstraint, EngineError> {
        let field = validate_field(field)?;
        let name = IndexConstraint::name_for(&field);
        let _guard = self.constraint_locks.lock(&name).await;

        let mut constraint = self.require(&name).await?;
        match constraint.state {
            ConstraintState::Removed => {
                debug!(index = %name, "constraint already removed");
                return Ok(constraint);
            }
            ConstraintState::Active => {
                return Err(EngineError::Migration(format!(
                    "{} must be deprecated before removal",
                    name
                )))
            }
            ConstraintState::Deprecated => {}
        }
        let replacement = self.replacement_of(&constraint).await?;

        let remaining = self.count_relying(&field, replacement.field()).await?;
        if remaining > 0 {
            warn!(index = %name, remaining, "documents still rely on the old field");
            return Err(EngineError::MigrationBlocked { field, remaining });
        }

        let dropped = self.store.drop_index(&name).await?;
        constraint
            .advance(ConstraintState::Removed)
            .map_err(|e| EngineError::Migration(e.to_string()))?;
        self.store.put_constraint(&constraint).await?;
        self.refresh().await?;
        info!(index = %name, dropped, "constraint removed");
        Ok(constraint)
    }

    /// Run a whole rename; returns the removed old constraint.
    pub async fn rename_field(&self, from: &str, to: &str) -> Result<IndexConstraint, EngineError> {
        self.begin_rename(from, to).await?;
        self.deprecate(from).await?;
        self.finalize(from).await
    }

    pub async fn status(&self) -> Result<MigrationStatus, EngineError> {
        let constraints = self.store.list_constraints().await?;
        let indexes = self.store.list_indexes().await?;
        let ghost_indexes = indexes
            .iter()
            .filter(|i| !constraints.iter().any(|c| c.is_live() && c.name == i.name))
            .map(|i| i.name.clone())
            .collect();
        Ok(MigrationStatus {
            layout: SchemaLayout::from_constraints(&constraints),
            constraints,
            indexes,
            ghost_indexes,
        })
    }

    async fn lock_pair(&self, a: &str, b: &str) -> (OwnedMutexGuard<()>, OwnedMutexGuard<()>) {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        let first = self.constraint_locks.lock(&first.to_string()).await;
        let second = self.constraint_locks.lock(&second.to_string()).await;
        (first, second)
    }

    async fn refresh(&self) -> Result<(), EngineError> {
        let _guard = self.catalog.lock().await;
        let constraints = self.store.list_constraints().await?;
        self.schema.replace(constraints).await;
        Ok(())
    }

    async fn find(&self, name: &str) -> Result<Option<IndexConstraint>, EngineError> {
        Ok(self
            .store
            .list_constraints()
            .await?
            .into_iter()
            .find(|c| c.name == name))
    }

    async fn require(&self, name: &str) -> Result<IndexConstraint, EngineError> {
        self.find(name)
            .await?
            .ok_or_else(|| EngineError::Migration(format!("no constraint named {}", name)))
    }

    async fn replacement_of(&self, constraint: &IndexConstraint) -> Result<IndexConstraint, EngineError> {
        let target = constraint.replaced_by.as_deref().ok_or_else(|| {
            EngineError::Migration(format!(
                "{} has no replacement; begin a rename first",
                constraint.name
            ))
        })?;
        let replacement = self.require(target).await?;
        if !replacement.is_live() {
            return Err(EngineError::Migration(format!(
                "replacement {} is {}",
                target, replacement.state
            )));
        }
        Ok(replacement)
    }

    async fn create_index(&self, constraint: &IndexConstraint) -> Result<(), EngineError> {
        let spec = IndexSpec::new(constraint.name.clone(), constraint.fields.clone());
        match self.store.create_unique_index(spec).await {
            Ok(created) => {
                if created {
                    info!(index = %constraint.name, "unique index created");
                }
                Ok(())
            }
            Err(StoreError::DuplicateKey { index, key }) => Err(EngineError::Migration(format!(
                "existing documents violate {} (key {})",
                index, key
            ))),
            Err(err) => Err(err.into()),
        }
    }

    /// Copy the identifier into `to` for every document that lacks it.
    async fn backfill(&self, from: &str, to: &str) -> Result<usize, EngineError> {
        let mut updated = 0;
        for (key, _) in self.store.scan().await? {
            let id = match CredentialId::new(&key) {
                Ok(id) => id,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping document with unusable key");
                    continue;
                }
            };
            let _guard = self.id_locks.lock(&id).await;

            // Re-read under the lock; the reconciler may have rewritten it.
            let Some(mut doc) = self.store.get(&key).await? else {
                continue;
            };
            if has_value(&doc, to) {
                continue;
            }
            let value = doc
                .get(from)
                .filter(|v| !v.is_null())
                .cloned()
                .unwrap_or_else(|| Value::String(key.clone()));
            doc.insert(to.to_string(), value);
            let version = doc.get(VERSION_FIELD).and_then(Value::as_u64).unwrap_or(0) + 1;
            doc.insert(VERSION_FIELD.to_string(), Value::from(version));

            match self.store.upsert(&key, doc).await {
                Ok(()) => updated += 1,
                Err(StoreError::DuplicateKey { index, key: index_key }) => {
                    return Err(EngineError::Migration(format!(
                        "backfill of {} collides on {} (key {})",
                        key, index, index_key
                    )))
                }
                Err(err) => return Err(err.into()),
            }
        }
        if updated > 0 {
            debug!(from, to, updated, "backfill wrote documents");
        }
        Ok(updated)
    }

    /// Documents carrying `old` but not `new`.
    async fn count_relying(&self, old: &str, new: &str) -> Result<usize, EngineError> {
        Ok(self
            .store
            .scan()
            .await?
            .iter()
            .filter(|(_, doc)| has_value(doc, old) && !has_value(doc, new))
            .count())
    }
}

fn has_value(doc: &Document, field: &str) -> bool {
    doc.get(field).is_some_and(|v| !v.is_null())
}

fn validate_field(raw: &str) -> Result<String, EngineError> {
    let field = raw.trim();
    if field.is_empty() {
        return Err(EngineError::InvalidInput("field name is empty".into()));
    }
    if !field
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(EngineError::InvalidInput(format!(
            "field name {} may only contain ASCII letters, digits and underscores",
            field
        )));
    }
    if codec::is_reserved(field) {
        return Err(EngineError::InvalidInput(format!(
            "field name {} is reserved",
            field
        )));
    }
    Ok(field.to_string())
}
