//! `attest migrate`: Unique-constraint lifecycle.
//!
//! A rename runs in three steps so the old index is only dropped once no
//! document depends on it: `rename`, `deprecate`, `finalize`.

use clap::{Args, Subcommand};
use serde::{Deserialize, Serialize};

use super::ApiClient;

#[derive(Args, Debug)]
pub struct MigrateArgs {
    #[command(subcommand)]
    pub action: MigrateAction,
}

#[derive(Subcommand, Debug)]
pub enum MigrateAction {
    /// List constraints, the live layout and any ghost indexes.
    Status,
    /// Start renaming a unique field.
    Rename { from: String, to: String },
    /// Mark the old field deprecated and backfill its replacement.
    Deprecate { field: String },
    /// Drop the old field's index.
    Finalize { field: String },
}

#[derive(Serialize)]
struct RenameRequest<'a> {
    from: &'a str,
    to: &'a str,
}

#[derive(Serialize)]
struct FieldRequest<'a> {
    field: &'a str,
}

#[derive(Deserialize)]
struct Constraint {
    name: String,
    fields: Vec<String>,
    purpose: String,
    state: String,
    #[serde(default)]
    replaced_by: Option<String>,
}

#[derive(Deserialize)]
struct StatusResponse {
    constraints: Vec<Constraint>,
    ghost_indexes: Vec<String>,
}

fn print_constraint(c: &Constraint) {
    let replaced = c
        .replaced_by
        .as_deref()
        .map(|r| format!(" -> {}", r))
        .unwrap_or_default();
    println!(
        "  {:<24} [{}] {:<10} {:<11}{}",
        c.name,
        c.fields.join(","),
        c.purpose,
        c.state,
        replaced
    );
}

pub async fn run(client: &ApiClient, args: &MigrateArgs) -> anyhow::Result<()> {
    let constraint: Constraint = match &args.action {
        MigrateAction::Status => {
            let status: StatusResponse = client.get("/api/v1/admin/constraints").await?;
            println!("Constraints:");
            for c in &status.constraints {
                print_constraint(c);
            }
            if !status.ghost_indexes.is_empty() {
                println!("Ghost indexes (no live constraint):");
                for name in &status.ghost_indexes {
                    println!("  {}", name);
                }
            }
            return Ok(());
        }
        MigrateAction::Rename { from, to } => {
            client
                .post("/api/v1/admin/migrations/rename", &RenameRequest { from, to })
                .await?
        }
        MigrateAction::Deprecate { field } => {
            client
                .post("/api/v1/admin/migrations/deprecate", &FieldRequest { field })
                .await?
        }
        MigrateAction::Finalize { field } => {
            client
                .post("/api/v1/admin/migrations/finalize", &FieldRequest { field })
                .await?
        }
    };
    print_constraint(&constraint);
    Ok(())
}
