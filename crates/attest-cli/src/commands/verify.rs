//! `attest verify`: Check whether a credential is valid right now.

use clap::{Args, ValueEnum};
use serde::Deserialize;

use super::ApiClient;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Consistency {
    /// Answer from the index store unless it looks stale.
    Cached,
    /// Always consult the ledger.
    Strong,
}

impl Consistency {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Strong => "strong",
        }
    }
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Credential identifier or verification token.
    pub target: String,

    #[arg(short, long, value_enum, default_value = "cached")]
    pub consistency: Consistency,
}

#[derive(Deserialize)]
struct VerdictResponse {
    credential_id: String,
    status: String,
    as_of: String,
    source: String,
    #[serde(default)]
    pending_tx: Option<String>,
    #[serde(default)]
    failure_reason: Option<String>,
}

pub async fn run(client: &ApiClient, args: &VerifyArgs) -> anyhow::Result<()> {
    let path = format!(
        "/api/v1/verify/{}?consistency={}",
        args.target,
        args.consistency.as_str()
    );
    let verdict: VerdictResponse = client.get(&path).await?;
    let valid = verdict.status == "active";
    println!("{}", if valid { "VALID" } else { "NOT VALID" });
    println!("  ID:      {}", verdict.credential_id);
    println!("  Status:  {}", verdict.status);
    println!("  As of:   {}", verdict.as_of);
    println!("  Source:  {}", verdict.source);
    if let Some(tx) = verdict.pending_tx {
        println!("  Pending: {}", tx);
    }
    if let Some(reason) = verdict.failure_reason {
        println!("  Reason:  {}", reason);
    }
    Ok(())
}
