// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Bazaar Node
//!
//! Entry point for the `bazaar-node` binary. Parses CLI arguments, initializes
//! logging and metrics, and runs the exchange application until a shutdown
//! signal arrives.
//!
//! The binary supports three subcommands:
//!
//! - `run`     start the node
//! - `init`    initialize the data directory and generate a node key
//! - `version` print build version information

mod cli;
mod config;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use bazaar_protocol::crypto::NodeKeypair;
use bazaar_protocol::storage::SledStore;
use bazaar_protocol::wallet::InMemoryWallet;
use bazaar_protocol::{AppHandle, Application};

use cli::{BazaarNodeCli, Commands};
use config::NodeConfig;
use logging::LogFormat;
use metrics::NodeMetrics;

const KEY_FILE: &str = "node.key";
const CONFIG_FILE: &str = "config.toml";

/// Gauges are also resampled on this period when the node is quiet.
const METRICS_SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = BazaarNodeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the exchange application and the metrics endpoint.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(
        logging::DEFAULT_DIRECTIVES,
        LogFormat::from_str_lossy(&args.log_format),
    );

    // --- Configuration ---
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| args.data_dir.join(CONFIG_FILE));
    let mut node_config = NodeConfig::load(&config_path)?;
    apply_overrides(&mut node_config, &args);
    let app_config = node_config.app_config()?;

    tracing::info!(
        p2p_port = node_config.p2p_port,
        metrics_port = node_config.metrics_port,
        advertised = %app_config.advertised_address,
        seeds = app_config.seed_nodes.len(),
        data_dir = %args.data_dir.display(),
        "starting bazaar-node"
    );

    // --- Persistent storage ---
    let db_path = args.data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let store = Arc::new(
        SledStore::open(&db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?,
    );
    tracing::info!(path = %db_path.display(), "database opened");

    // --- Identity ---
    let keypair = load_or_create_key(&args.data_dir.join(KEY_FILE))?;
    tracing::info!(public_key = %keypair.public_key().to_hex(), "node key loaded");

    // --- Wallet ---
    let (wallet, wallet_events) = InMemoryWallet::new(node_config.dev_balance);
    let wallet = Arc::new(wallet);
    tracing::warn!(
        balance = node_config.dev_balance,
        "using the in-memory development wallet; funds are not real"
    );

    // --- Application ---
    let app = Application::new(app_config, keypair, wallet, wallet_events, store)
        .context("failed to initialize application")?;
    let (handle, app_task) = app.start().await.context("failed to start application")?;

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to create metrics registry")?);
    let metrics_loop = tokio::spawn(feed_metrics(handle.clone(), Arc::clone(&node_metrics)));

    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", node_config.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, withdrawing offers");
        }
    }

    handle.shutdown().await?;
    metrics_loop.abort();
    if let Err(e) = app_task.await {
        tracing::error!("application task ended abnormally: {}", e);
    }
    tracing::info!("bazaar-node stopped");
    Ok(())
}

fn apply_overrides(config: &mut NodeConfig, args: &cli::RunArgs) {
    if let Some(port) = args.p2p_port {
        config.p2p_port = port;
    }
    if let Some(port) = args.metrics_port {
        config.metrics_port = port;
    }
    if let Some(host) = &args.advertised_host {
        config.advertised_host = host.clone();
    }
    if !args.seeds.is_empty() {
        config.seeds = args.seeds.clone();
    }
    if let Some(balance) = args.dev_balance {
        config.dev_balance = balance;
    }
}

/// Count every application event and keep the gauges current.
async fn feed_metrics(handle: AppHandle, metrics: Arc<NodeMetrics>) {
    let mut events = handle.subscribe();
    let mut sample = tokio::time::interval(METRICS_SAMPLE_INTERVAL);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    metrics.observe(&event);
                    metrics.sample(&handle);
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "metrics fell behind the event stream");
                }
                Err(RecvError::Closed) => break,
            },
            _ = sample.tick() => metrics.sample(&handle),
        }
    }
}

/// Read the node key from `path`, generating and saving one if absent.
fn load_or_create_key(path: &Path) -> Result<NodeKeypair> {
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read node key from {}", path.display()))?;
        return NodeKeypair::from_hex(&text)
            .with_context(|| format!("corrupt node key in {}", path.display()));
    }
    let keypair = NodeKeypair::generate();
    write_key(path, &keypair)?;
    tracing::info!(key_path = %path.display(), "generated new node key");
    Ok(keypair)
}

fn write_key(path: &Path, keypair: &NodeKeypair) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, hex::encode(keypair.secret_key_bytes()))
        .with_context(|| format!("failed to write node key to {}", path.display()))?;

    // Restrict permissions on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Initializes a new node data directory with a config file and a node key.
fn init_node(args: cli::InitArgs) -> Result<()> {
    logging::init_logging("bazaar_node=info", LogFormat::Pretty);

    let data_dir = &args.data_dir;
    tracing::info!(data_dir = %data_dir.display(), "initializing node");

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

    let key_path = data_dir.join(KEY_FILE);
    if key_path.exists() && !args.force {
        anyhow::bail!(
            "{} already exists; pass --force to replace it",
            key_path.display()
        );
    }
    let keypair = NodeKeypair::generate();
    write_key(&key_path, &keypair)?;
    let pubkey_hex = keypair.public_key().to_hex();

    let config_path = data_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        let config = NodeConfig {
            p2p_port: args.p2p_port,
            metrics_port: args.metrics_port,
            ..NodeConfig::default()
        };
        std::fs::write(&config_path, config.to_toml()?)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
    }

    tracing::info!(
        public_key = %pubkey_hex,
        key_path = %key_path.display(),
        "node keypair generated"
    );

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Config         : {}", config_path.display());
    println!("  Node key       : {}", key_path.display());
    println!("  Public key     : {}", pubkey_hex);

    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    println!("bazaar-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol    {}", bazaar_protocol::config::PROTOCOL_VERSION);
    println!("rustc       {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. A handler that cannot
/// be installed never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
