use clap::{Args, Parser, Subcommand};

/// Diagnostic client for ledger-link networks.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run endpoint selection for the configured graphql network and print the winner.
    Select(SelectCmd),
    /// Send one raw request over the configured transport and print the response.
    Query(QueryCmd),
}

#[derive(Args, Debug)]
pub struct SelectCmd {
    /// Path to the probe configuration TOML file.
    /// If not provided, default values will be used.
    #[arg(short, long)]
    pub config: Option<String>,
}

#[derive(Args, Debug)]
pub struct QueryCmd {
    #[arg(short, long)]
    pub config: Option<String>,

    /// Raw request body, e.g. a graphql `{"query": "..."}` document.
    #[arg(long)]
    pub payload: String,

    /// Route the request to the authoritative endpoint (jrpc only).
    #[arg(long)]
    pub requires_db: bool,
}
