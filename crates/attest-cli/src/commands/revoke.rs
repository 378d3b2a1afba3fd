//! `attest revoke` and `attest show`.

use clap::Args;
use serde::Deserialize;

use super::issue::{print_credential, CredentialResponse};
use super::ApiClient;

#[derive(Args, Debug)]
pub struct RevokeArgs {
    /// Credential identifier.
    pub id: String,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Credential identifier.
    pub id: String,
}

#[derive(Deserialize)]
struct TransactionResponse {
    hash: String,
    kind: String,
    outcome: String,
    confirmations: u32,
}

pub async fn run(client: &ApiClient, args: &RevokeArgs) -> anyhow::Result<()> {
    let path = format!("/api/v1/credentials/{}/revoke", args.id);
    let tx: TransactionResponse = client.post(&path, &serde_json::json!({})).await?;
    println!("Revocation submitted; awaiting ledger finality.");
    println!("  Tx:             {}", tx.hash);
    println!("  Kind:           {}", tx.kind);
    println!("  Outcome:        {}", tx.outcome);
    println!("  Confirmations:  {}", tx.confirmations);
    Ok(())
}

pub async fn show(client: &ApiClient, args: &ShowArgs) -> anyhow::Result<()> {
    let path = format!("/api/v1/credentials/{}", args.id);
    let data: CredentialResponse = client.get(&path).await?;
    println!("Credential:");
    print_credential(&data);
    Ok(())
}
