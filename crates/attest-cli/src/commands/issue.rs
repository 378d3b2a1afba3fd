//! `attest issue`: Issue a credential.

use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::ApiClient;

#[derive(Args, Debug)]
pub struct IssueArgs {
    /// Credential identifier (e.g. a student number).
    pub id: String,

    /// Document file to hash locally.
    #[arg(short, long, conflicts_with = "hash")]
    pub file: Option<PathBuf>,

    /// Precomputed BLAKE3 hex hash of the document.
    #[arg(long)]
    pub hash: Option<String>,
}

#[derive(Serialize)]
struct IssueRequest {
    id: String,
    document_hash: String,
}

#[derive(Deserialize)]
pub(crate) struct CredentialResponse {
    pub id: String,
    pub status: String,
    pub verification_token: String,
    pub document_hash: String,
    #[serde(default)]
    pub issuance_tx: Option<String>,
}

pub(crate) fn print_credential(data: &CredentialResponse) {
    println!("  ID:        {}", data.id);
    println!("  Status:    {}", data.status);
    println!("  Token:     {}", data.verification_token);
    println!("  Document:  {}", data.document_hash);
    if let Some(tx) = &data.issuance_tx {
        println!("  Tx:        {}", tx);
    }
}

fn document_hash(args: &IssueArgs) -> anyhow::Result<String> {
    match (&args.file, &args.hash) {
        (Some(path), _) => {
            let bytes = std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
            Ok(blake3::hash(&bytes).to_hex().to_string())
        }
        (None, Some(hash)) => Ok(hash.clone()),
        (None, None) => anyhow::bail!("pass --file or --hash"),
    }
}

pub async fn run(client: &ApiClient, args: &IssueArgs) -> anyhow::Result<()> {
    let body = IssueRequest {
        id: args.id.clone(),
        document_hash: document_hash(args)?,
    };
    let data: CredentialResponse = client.post("/api/v1/credentials", &body).await?;
    println!("Issuance submitted; awaiting ledger finality.");
    print_credential(&data);
    Ok(())
}
