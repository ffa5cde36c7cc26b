use anyhow::{Context, Result, bail};
use clap::Parser;
use server::auth::ClientCredentialsProvider;
use server::model::EntityKind;
use server::operations::{ClientPool, MessageTransport, PooledClient};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod commands;
mod config;
mod logger;

use commands::{Command, CommandContext};
use config::AppConfig;

/// Inspect, manage and stream Azure Service Bus entities.
#[derive(Debug, Parser)]
#[command(name = "busscope", version, about)]
struct Cli {
    /// Configuration file (default: ./config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Saved connection profile to use
    #[arg(long, short, global = true)]
    profile: Option<String>,
    /// Connection string, overriding profiles and configuration
    #[arg(long, global = true, env = "BUSSCOPE_CONNECTION_STRING", hide_env_values = true)]
    connection_string: Option<String>,
    /// Treat an EntityPath in the connection string as a topic
    #[arg(long, global = true)]
    topic: bool,
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

async fn connect(cli: &Cli, config: &AppConfig, pool: &ClientPool) -> Result<PooledClient> {
    let options = config.operations();
    let kind = if cli.topic {
        EntityKind::Topic
    } else {
        EntityKind::Queue
    };

    if let Some(connection_string) = cli.connection_string.as_deref() {
        log::info!("Using connection string from the command line");
        return Ok(pool.connection_string(connection_string, kind, options).await?);
    }

    if let Some(name) = cli.profile.as_deref().or(config.default_profile()) {
        let profile = config
            .profile(name)
            .with_context(|| format!("No connection profile named '{name}'"))?;
        return Ok(profile.open(pool, options).await?);
    }

    if let Some(connection_string) = config.connection_string() {
        return Ok(pool.connection_string(connection_string, kind, options).await?);
    }

    if let Some(namespace) = config.namespace() {
        log::info!("Using Azure AD credentials for namespace {}", namespace.namespace);
        let auth = ClientCredentialsProvider::new(config.azure_ad().clone())?;
        return Ok(pool
            .azure_credential(Arc::new(auth), namespace, options)
            .await?);
    }

    bail!(
        "No connection configured. Pass --connection-string, select a --profile, \
         or set connection_string or [namespace] in config.toml"
    )
}

async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    let pool = ClientPool::new();
    let client = connect(&cli, &config, &pool).await?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    let transport: Arc<dyn MessageTransport> = Arc::new(client);
    let ctx = CommandContext {
        transport,
        config: &config,
        cancel,
        json: cli.json,
    };
    let outcome = commands::run(cli.command, &ctx).await;

    drop(ctx);
    pool.shutdown().await;
    outcome
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::load_config(cli.config.as_deref())?;
    logger::setup_logger(config.logging(), cli.verbose)?;
    log::debug!("Loaded configuration with {} profiles", config.profiles().len());

    run(cli, config).await
}
