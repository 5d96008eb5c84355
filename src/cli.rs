use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::{Config, load_config};
use crate::dedup::DuplicateResolver;
use crate::gateway::{self, GatewayState};
use crate::hub::BroadcastHub;
use crate::reconcile::ReconcileEngine;
use crate::store::{GatewayKind, NewIntegration, SqliteStore, Store};

#[derive(Parser)]
#[command(name = "courier", version, about = "Messaging ingestion and reconciliation service")]
pub struct Cli {
    /// Path to the JSON configuration file (defaults to ./courier.json).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the ingestion service (default).
    Serve,
    /// Run one duplicate-resolution sweep and exit.
    Sweep,
    /// Manage gateway integrations.
    Integration {
        #[command(subcommand)]
        command: IntegrationCommand,
    },
}

#[derive(Subcommand)]
pub enum IntegrationCommand {
    /// Register a gateway integration.
    Add {
        /// The gateway's own session/instance identifier.
        #[arg(long)]
        external_ref: String,
        /// Gateway kind: WHATSAPP_WEB, WHATSAPP_CLOUD or INSTAGRAM_GRAPH.
        #[arg(long)]
        kind: String,
        #[arg(long)]
        instance_url: Option<String>,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        agent_id: Option<String>,
    },
    /// List configured integrations.
    List,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Sweep => sweep(config).await,
        Command::Integration { command } => integration(config, command).await,
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    Ok(Arc::new(SqliteStore::new(&config.database.path)?))
}

async fn serve(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let engine = Arc::new(ReconcileEngine::new(
        store.clone(),
        config.identity.clone(),
        config.ingest.clone(),
    ));
    let resolver = Arc::new(DuplicateResolver::new(
        store.clone(),
        config.identity.clone(),
        &config.dedup,
    ));
    let hub = Arc::new(BroadcastHub::new(config.hub.send_buffer));
    let sweeper = hub.start_sweeper(config.hub.sweep_interval_secs);

    if config.dedup.sweep_interval_secs > 0 {
        let resolver = resolver.clone();
        let period = Duration::from_secs(config.dedup.sweep_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // the immediate first tick
            loop {
                interval.tick().await;
                if let Err(e) = resolver.sweep().await {
                    error!("periodic sweep failed: {}", e);
                }
            }
        });
        info!(
            "periodic duplicate sweep every {}s",
            config.dedup.sweep_interval_secs
        );
    }

    let state = GatewayState {
        engine,
        resolver,
        hub: hub.clone(),
        webhook_secret: config.server.webhook_secret.clone(),
    };
    let (server, _addr) = gateway::start(&config.server.host, config.server.port, state).await?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    hub.shutdown();
    sweeper.abort();
    server.abort();
    Ok(())
}

async fn sweep(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    let resolver = DuplicateResolver::new(store, config.identity.clone(), &config.dedup);
    let report = resolver.sweep().await?;
    println!(
        "sweep: {} phone group(s), {} contact(s) merged, {} conversation(s) collapsed, {} group(s) need manual review",
        report.phone_groups,
        report.contacts_merged,
        report.conversations_collapsed,
        report.failed_groups
    );
    Ok(())
}

async fn integration(config: Config, command: IntegrationCommand) -> Result<()> {
    let store = open_store(&config)?;
    match command {
        IntegrationCommand::Add {
            external_ref,
            kind,
            instance_url,
            api_key,
            agent_id,
        } => {
            let kind: GatewayKind = kind
                .to_uppercase()
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            let integration = store
                .create_integration(NewIntegration {
                    external_ref,
                    kind,
                    instance_url,
                    api_key,
                    agent_id,
                })
                .await?;
            println!(
                "integration {} registered: {} ({})",
                integration.id, integration.external_ref, integration.kind
            );
        }
        IntegrationCommand::List => {
            let integrations = store.list_integrations().await?;
            if integrations.is_empty() {
                println!("no integrations configured");
            }
            for integration in integrations {
                println!(
                    "{}  {}  {}  {}",
                    integration.id,
                    integration.external_ref,
                    integration.kind,
                    integration.status.as_str()
                );
            }
        }
    }
    Ok(())
}
