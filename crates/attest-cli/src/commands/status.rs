//! `attest status`: Query the status of a running node.

use serde::Deserialize;

use super::ApiClient;

#[derive(Deserialize)]
struct StatusResponse {
    version: String,
    ledger: String,
    required_confirmations: u32,
    uptime_secs: u64,
}

pub async fn run(client: &ApiClient) -> anyhow::Result<()> {
    let status: StatusResponse = client.get("/api/v1/status").await?;
    println!("Node Status:");
    println!("  Version:        {}", status.version);
    println!("  Ledger:         {}", status.ledger);
    println!("  Confirmations:  {}", status.required_confirmations);
    println!("  Uptime:         {}s", status.uptime_secs);
    Ok(())
}
