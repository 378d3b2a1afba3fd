//! Unique-index lifecycle and the document shape it implies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// Default document field carrying the credential identifier.
pub const DEFAULT_ID_FIELD: &str = "registration_number";

/// Document field carrying the verification token.
pub const DEFAULT_TOKEN_FIELD: &str = "verification_token";

/// Lifecycle of a unique constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintState {
    /// Index exists and the write path populates its fields.
    Active,
    /// Index still exists, fields are still dual-written, but it is on its way out.
    Deprecated,
    /// Underlying index dropped. Terminal.
    Removed,
}

impl fmt::Display for ConstraintState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Deprecated => write!(f, "deprecated"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// What a constraint's field holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintPurpose {
    /// The credential identifier.
    Identifier,
    /// The verification token.
    Token,
}

/// A named unique index and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConstraint {
    pub name: String,
    pub fields: Vec<String>,
    pub purpose: ConstraintPurpose,
    pub state: ConstraintState,
    /// Name of the constraint that supersedes this one, once a rename starts.
    #[serde(default)]
    pub replaced_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IndexConstraint {
    /// Conventional index name for a single-field unique constraint.
    pub fn name_for(field: &str) -> String {
        format!("uniq_{}", field)
    }

    /// A new active single-field constraint.
    pub fn single(field: &str, purpose: ConstraintPurpose) -> Self {
        let now = Utc::now();
        Self {
            name: Self::name_for(field),
            fields: vec![field.to_string()],
            purpose,
            state: ConstraintState::Active,
            replaced_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Constraints a fresh store starts with.
    pub fn baseline() -> Vec<Self> {
        vec![
            Self::single(DEFAULT_ID_FIELD, ConstraintPurpose::Identifier),
            Self::single(DEFAULT_TOKEN_FIELD, ConstraintPurpose::Token),
        ]
    }

    /// The field of a single-field constraint.
    pub fn field(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or_default()
    }

    /// Whether the index physically exists in the store.
    pub fn is_live(&self) -> bool {
        !matches!(self.state, ConstraintState::Removed)
    }

    /// Advance along `active → deprecated → removed`.
    ///
    /// Advancing to the current state is a no-op returning `Ok(false)`.
    pub fn advance(&mut self, to: ConstraintState) -> Result<bool, CoreError> {
        let allowed = matches!(
            (self.state, to),
            (ConstraintState::Active, ConstraintState::Deprecated)
                | (ConstraintState::Deprecated, ConstraintState::Removed)
        );
        if self.state == to {
            return Ok(false);
        }
        if !allowed {
            return Err(CoreError::ValidationError(format!(
                "constraint {} cannot move from {} to {}",
                self.name, self.state, to
            )));
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(true)
    }
}

/// Which document fields the write path populates and the read path consults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaLayout {
    /// Every field the identifier is written under (primary first).
    pub id_fields: Vec<String>,
    /// Field carrying the verification token.
    pub token_field: String,
}

impl Default for SchemaLayout {
    fn default() -> Self {
        Self {
            id_fields: vec![DEFAULT_ID_FIELD.to_string()],
            token_field: DEFAULT_TOKEN_FIELD.to_string(),
        }
    }
}

impl SchemaLayout {
    /// Derive the layout from the constraint catalog.
    ///
    /// Identifier fields of active and deprecated constraints are all
    /// written; the newest active one is primary. Falls back to the defaults
    /// for an empty catalog.
    pub fn from_constraints(constraints: &[IndexConstraint]) -> Self {
        let mut id_constraints: Vec<&IndexConstraint> = constraints
            .iter()
            .filter(|c| c.purpose == ConstraintPurpose::Identifier && c.is_live())
            .collect();
        id_constraints.sort_by(|a, b| {
            let rank = |c: &IndexConstraint| matches!(c.state, ConstraintState::Deprecated);
            rank(a)
                .cmp(&rank(b))
                .then_with(|| b.created_at.cmp(&a.created_at))
        });

        let mut id_fields: Vec<String> = Vec::new();
        for c in id_constraints {
            let field = c.field().to_string();
            if !id_fields.contains(&field) {
                id_fields.push(field);
            }
        }
        if id_fields.is_empty() {
            id_fields.push(DEFAULT_ID_FIELD.to_string());
        }

        let token_field = constraints
            .iter()
            .find(|c| c.purpose == ConstraintPurpose::Token && c.is_live())
            .map(|c| c.field().to_string())
            .unwrap_or_else(|| DEFAULT_TOKEN_FIELD.to_string());

        Self {
            id_fields,
            token_field,
        }
    }

    /// The field the identifier is read from first.
    pub fn primary_id_field(&self) -> &str {
        self.id_fields
            .first()
            .map(String::as_str)
            .unwrap_or(DEFAULT_ID_FIELD)
    }
}
