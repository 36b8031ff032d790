mod auth;
mod config;
mod connection;
mod events;
mod gateway_server;
mod protocol;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use auth::{HttpSigningKeyProvider, TokenVerifier};
use config::Config;
use events::WsEventChannel;
use gateway_server::GatewayServer;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "WebSocket event gateway with bearer-token admission")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "EVENTGATE_CONFIG",
        default_value = "eventgate.toml"
    )]
    config: PathBuf,

    /// Override the WebSocket listener address.
    #[arg(long, global = true, env = "EVENTGATE_BIND")]
    bind: Option<String>,

    /// Override the external event bus URL.
    #[arg(long = "events-url", global = true, env = "EVENTGATE_EVENTS_URL")]
    events_url: Option<String>,

    /// Override the signing-key service base URL.
    #[arg(long = "keys-url", global = true, env = "EVENTGATE_KEYS_URL")]
    keys_url: Option<String>,

    /// Log level filter, e.g. info,debug,trace.
    #[arg(long, global = true, env = "EVENTGATE_LOG", default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the gateway.
    Run,
    /// Load and validate the config, then print the effective values.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log)?;

    let mut config = Config::load(&cli.config)?;
    config.apply_cli_overrides(
        cli.bind.as_deref(),
        cli.events_url.as_deref(),
        cli.keys_url.as_deref(),
    );
    config.validate()?;

    match cli.command.unwrap_or(CliCommand::Run) {
        CliCommand::Run => run_gateway(config).await,
        CliCommand::Check => {
            let rendered =
                toml::to_string_pretty(&config).context("failed rendering effective config")?;
            println!("{rendered}");
            Ok(())
        }
    }
}

async fn run_gateway(config: Config) -> Result<()> {
    let provider = Arc::new(HttpSigningKeyProvider::new(&config.auth.keys_url));
    let verifier = Arc::new(TokenVerifier::new(provider));
    let events = Arc::new(WsEventChannel::new(config.events.url.clone()));

    let server = GatewayServer::new(config);
    server
        .run_until(verifier, events, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
}

fn init_logging(filter: &str) -> Result<()> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env)
        .with_target(false)
        .init();
    Ok(())
}
