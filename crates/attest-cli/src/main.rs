//! Attest CLI: talks to a running attest-node over its HTTP API.
//!
//! Subcommands: status, issue, revoke, show, verify, migrate.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Attest: ledger-backed credential registry.
#[derive(Parser, Debug)]
#[command(name = "attest", version, about, long_about = None)]
struct Cli {
    /// API endpoint of the node.
    #[arg(short, long, global = true, default_value = "http://127.0.0.1:9001")]
    endpoint: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Query the status of a running node.
    Status,
    /// Issue a credential anchored to a document.
    Issue(commands::issue::IssueArgs),
    /// Revoke an issued credential.
    Revoke(commands::revoke::RevokeArgs),
    /// Show the cached record of a credential.
    Show(commands::revoke::ShowArgs),
    /// Verify a credential by identifier or verification token.
    Verify(commands::verify::VerifyArgs),
    /// Inspect and drive unique-constraint migrations.
    Migrate(commands::migrate::MigrateArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let client = commands::ApiClient::new(&cli.endpoint);

    match &cli.command {
        Commands::Status => commands::status::run(&client).await,
        Commands::Issue(args) => commands::issue::run(&client, args).await,
        Commands::Revoke(args) => commands::revoke::run(&client, args).await,
        Commands::Show(args) => commands::revoke::show(&client, args).await,
        Commands::Verify(args) => commands::verify::run(&client, args).await,
        Commands::Migrate(args) => commands::migrate::run(&client, args).await,
    }
}
