// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use llmfleet::config::{default_config_path, Config, LogFormat};
use llmfleet::queue::{JobQueue, Orchestrator, OrchestratorConfig};
use llmfleet::{
    FleetService, Identity, OllamaClient, OllamaExecutor, Permission, ProgressStreamer, Reconciler,
    ResourceStore, Server, TokenRegistry,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
}

use colors::*;

/// llmfleet - pools, backends, model access control and download orchestration.
#[derive(Parser)]
#[command(name = "llmfleet")]
#[command(version = VERSION)]
#[command(about = "Manage a fleet of inference backends and the models they host.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server, dispatcher and reconciler
    ///
    /// Examples:
    ///   llmfleet serve
    ///   llmfleet serve --config fleet.json --port 9000
    Serve {
        /// Config file (defaults to ~/.llmfleet/config.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind to
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Print the permission catalog
    Permissions,

    /// Load and validate a config file without starting anything
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(format: LogFormat) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llmfleet=info,tower_http=warn"));

    let (pretty, json) = match format {
        LogFormat::Pretty => (Some(tracing_subscriber::fmt::layer().with_target(true)), None),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(pretty)
        .with(json)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

fn load_config(path: Option<PathBuf>, port: Option<u16>, bind: Option<String>) -> Result<Config> {
    let mut config = Config::load(path.as_deref())?;
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(bind) = bind {
        config.bind_address = bind;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn serve(config: Config) -> Result<()> {
    let store = Arc::new(match &config.state_path {
        Some(path) => ResourceStore::open(path)?,
        None => {
            tracing::warn!("No state_path configured, resources will not survive a restart");
            ResourceStore::in_memory()
        }
    });

    for identity in &config.identities {
        store.upsert_identity(Identity {
            subject: identity.subject.clone(),
            friendly_name: identity.friendly_name.clone(),
            email: identity.email.clone(),
        });
    }

    let streamer = Arc::new(ProgressStreamer::new(config.queue.stream_buffer));
    let queue = Arc::new(JobQueue::new(streamer, config.queue.job_validity()));
    let client = OllamaClient::new()?;
    let shutdown = CancellationToken::new();

    let orchestrator = Orchestrator::new(
        queue.clone(),
        store.clone(),
        Arc::new(OllamaExecutor::new(client.clone())),
        OrchestratorConfig {
            dispatch_interval: config.queue.dispatch_interval(),
            sweep_interval: config.queue.sweep_interval(),
            max_concurrent: config.queue.max_concurrent_downloads,
        },
    );
    let orchestrator_handle = orchestrator.spawn(shutdown.clone());

    let reconciler = Reconciler::new(store.clone(), queue.clone(), Arc::new(client));
    let reconcile_handle = reconciler
        .clone()
        .spawn(config.reconcile_interval(), shutdown.clone());

    let service = Arc::new(FleetService::new(store, queue).with_reconciler(reconciler));
    for identity in config.identities.iter().filter(|i| i.admin) {
        if service.access().seed_admin(&identity.subject)? {
            tracing::info!(subject = %identity.subject, "Seeded admin access");
        }
    }
    if config.identities.is_empty() {
        tracing::warn!("No identities configured, every authenticated route will answer 401");
    }

    let server = Server::new(service, TokenRegistry::from_identities(&config.identities))
        .with_port(config.port)
        .with_bind_address(config.bind_address.clone())
        .with_request_timeout(config.request_timeout())
        .with_rate_limit(config.rate_limit.clone());

    let result = server.start(shutdown.clone()).await;

    shutdown.cancel();
    let (orchestrator_result, reconcile_result) = tokio::join!(orchestrator_handle, reconcile_handle);
    if let Err(e) = orchestrator_result {
        tracing::error!("Orchestrator task failed: {}", e);
    }
    if let Err(e) = reconcile_result {
        tracing::error!("Reconciler task failed: {}", e);
    }

    result
}

fn check_config(path: Option<PathBuf>) -> Result<()> {
    let shown = match &path {
        Some(path) => path.display().to_string(),
        None => default_config_path()?.display().to_string(),
    };

    match load_config(path, None, None) {
        Ok(config) => {
            println!("{GREEN}[✓]{RESET} {BOLD}{}{RESET} is valid", shown);
            println!("    listen:      {}:{}", config.bind_address, config.port);
            println!(
                "    state:       {}",
                config
                    .state_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "in memory".to_string())
            );
            println!(
                "    identities:  {} ({} admin)",
                config.identities.len(),
                config.identities.iter().filter(|i| i.admin).count()
            );
            println!("    downloads:   {} concurrent", config.queue.max_concurrent_downloads);
            if config.rate_limit.is_none() {
                println!("{YELLOW}[!]{RESET} No rate limit configured");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{RED}[✗]{RESET} {} is invalid", shown);
            Err(e)
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, bind } => {
            let config = load_config(config, port, bind)?;
            init_tracing(config.log_format)?;
            tracing::info!(version = VERSION, "llmfleet starting");

            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            runtime.block_on(serve(config))
        }
        Commands::Permissions => {
            for permission in Permission::CATALOG {
                println!("{}", permission);
            }
            Ok(())
        }
        Commands::CheckConfig { config } => check_config(config),
    }
}
