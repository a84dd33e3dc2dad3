pub mod cli;
pub mod config;

use anyhow::{bail, Result};
use clap::Parser;
use cli::{Cli, Commands};
use config::{load_config, ProbeConfig};
use ledger_link_connector::{
    transport::{endpoint::Endpoint, gql::GqlSocket, jrpc::JrpcSocket, proto::ProtoSocket},
    ConnectionParams,
};

/// The main entry point for the probe: CLI parsing, configuration, logging and the
/// requested command.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Select(cmd) => {
            let config = load_config(cmd.config.as_deref())?;
            ledger_link_logger::init(&config.log)?;
            let endpoint = select(&config).await?;
            println!("{}", endpoint.url);
        }
        Commands::Query(cmd) => {
            let config = load_config(cmd.config.as_deref())?;
            ledger_link_logger::init(&config.log)?;
            let response = query(&config, cmd.payload, cmd.requires_db).await?;
            println!("{response}");
        }
    }

    Ok(())
}

fn http_client(config: &ProbeConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(config.connector.connection.request_timeout())
        .build()?)
}

/// Runs endpoint selection for the configured graphql network.
pub async fn select(config: &ProbeConfig) -> Result<Endpoint> {
    let descriptor = config.network.descriptor()?;
    let ConnectionParams::Graphql(params) = &descriptor.transport else {
        bail!("Endpoint selection needs a graphql network, got {}", descriptor.kind());
    };

    let socket = GqlSocket::new(params, http_client(config)?, config.connector.endpoints.clone());
    tracing::info!(network = descriptor.id, group = %descriptor.group(), "Selecting endpoint");
    Ok(socket.selector().select().await?)
}

/// Sends `payload` once over the configured socket and returns the raw response.
pub async fn query(config: &ProbeConfig, payload: String, requires_db: bool) -> Result<String> {
    let descriptor = config.network.descriptor()?;
    let client = http_client(config)?;
    tracing::info!(network = descriptor.id, kind = %descriptor.kind(), requires_db, "Sending raw request");

    match &descriptor.transport {
        ConnectionParams::Graphql(params) => {
            let socket = GqlSocket::new(params, client, config.connector.endpoints.clone());
            socket.query(payload).await
        }
        ConnectionParams::Jrpc(params) => JrpcSocket::new(params, client).request(payload, requires_db).await,
        ConnectionParams::Proto(params) => {
            let response = ProtoSocket::new(params, client).request(payload.into_bytes()).await?;
            Ok(String::from_utf8_lossy(&response).into_owned())
        }
        ConnectionParams::Proxy(_) => bail!("Proxy connections cannot be probed"),
    }
}
