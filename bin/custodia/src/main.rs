//! Custodia - on-chain treasury reconciliation engine.
//!
//! # Usage
//!
//! ```bash
//! # Start with environment configuration
//! DATABASE_URL=postgres://localhost/custodia \
//! EVM_RPC_URL=https://rpc.sepolia.org EVM_TREASURY=0x... \
//! SOLANA_RPC_URL=https://api.mainnet-beta.solana.com SOLANA_TREASURY=... \
//! custodia
//! ```
//!
//! Each chain family starts only if fully configured; a missing RPC URL or
//! treasury address disables that chain and the rest keep running.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, fmt};

use custodia_core::error::ReconcilerError;
use custodia_core::metrics::init_metrics;
use custodia_core::models::{ChainFamily, TreasuryEndpoint, monitored_set};
use custodia_core::ports::{ChainAdapter, TokenConfigSource};
use custodia_core::services::{
    CatchUpScanner, ReconciliationEngine, ScannerConfig, SignalCache, SubscriptionManager,
    TokenFeedWatcher,
};
use custodia_evm::{EvmAdapter, EvmClient, EvmClientConfig};
use custodia_solana::{SolanaAdapter, SolanaClientConfig, SolanaRpc};
use custodia_storage::{Database, DatabaseConfig, PgLedgerStore, PgTokenFeed, PgUserDirectory};

/// Custodia CLI - treasury deposit/withdrawal reconciler.
#[derive(Parser, Debug)]
#[command(name = "custodia")]
#[command(about = "Custodia - on-chain treasury reconciliation engine")]
#[command(version)]
struct Cli {
    /// PostgreSQL database URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost/custodia"
    )]
    database_url: String,

    /// EVM JSON-RPC endpoint (chain disabled when absent).
    #[arg(long, env = "EVM_RPC_URL")]
    evm_rpc_url: Option<String>,

    /// EVM chain identifier label.
    #[arg(long, env = "EVM_CHAIN_ID", default_value = "sepolia")]
    evm_chain_id: String,

    /// EVM treasury address to monitor (chain disabled when absent).
    #[arg(long, env = "EVM_TREASURY")]
    evm_treasury: Option<String>,

    /// Oldest EVM block the scanner will page back to.
    #[arg(long, env = "EVM_START_BLOCK", default_value = "0")]
    evm_start_block: u64,

    /// Catch-up poll interval for the EVM family, in seconds.
    #[arg(long, env = "EVM_POLL_SECS", default_value = "15")]
    evm_poll_secs: u64,

    /// Solana JSON-RPC endpoint (chain disabled when absent).
    #[arg(long, env = "SOLANA_RPC_URL")]
    solana_rpc_url: Option<String>,

    /// Solana chain identifier label.
    #[arg(long, env = "SOLANA_CHAIN_ID", default_value = "solana-mainnet")]
    solana_chain_id: String,

    /// Solana treasury address to monitor (chain disabled when absent).
    #[arg(long, env = "SOLANA_TREASURY")]
    solana_treasury: Option<String>,

    /// Catch-up poll interval for the Solana family, in seconds.
    #[arg(long, env = "SOLANA_POLL_SECS", default_value = "10")]
    solana_poll_secs: u64,

    /// Signatures/blocks per scan page.
    #[arg(long, env = "SCAN_PAGE_SIZE", default_value = "1000")]
    page_size: usize,

    /// Inter-page delay in milliseconds (provider rate limit).
    #[arg(long, env = "SCAN_PAGE_DELAY_MS", default_value = "500")]
    page_delay_ms: u64,

    /// Supported-token feed poll interval, in seconds.
    #[arg(long, env = "TOKEN_FEED_POLL_SECS", default_value = "60")]
    token_feed_poll_secs: u64,

    /// Prometheus metrics port.
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Run database migrations and exit.
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    // Prometheus metrics exporter (optional - failures don't crash the app)
    let metrics_enabled = match format!("0.0.0.0:{}", cli.metrics_port).parse::<std::net::SocketAddr>()
    {
        Ok(metrics_addr) => match PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
        {
            Ok(()) => {
                init_metrics();
                true
            }
            Err(e) => {
                warn!(
                    "⚠️  Failed to start metrics exporter: {}. Continuing without metrics.",
                    e
                );
                false
            }
        },
        Err(e) => {
            warn!("⚠️  Invalid metrics address: {}. Continuing without metrics.", e);
            false
        }
    };

    // ─────────────────────────────────────────────────────────────────────────
    // 🚀 STARTUP
    // ─────────────────────────────────────────────────────────────────────────
    info!("🚀 Starting Custodia reconciler");
    debug!(database_url = %mask_password(&cli.database_url), "Database endpoint");

    // ─────────────────────────────────────────────────────────────────────────
    // 🗄️ DATABASE
    // ─────────────────────────────────────────────────────────────────────────
    info!("🗄️  Connecting to database...");
    let db = Database::connect(&DatabaseConfig::for_reconciler(&cli.database_url))
        .await
        .context("Failed to connect to database")?;

    db.migrate().await.context("Failed to run migrations")?;
    info!("🗄️  Database ready (migrations applied)");

    if cli.migrate_only {
        info!("🛑 --migrate-only flag set, exiting");
        return Ok(());
    }

    let db = Arc::new(db);
    let store = Arc::new(PgLedgerStore::new(db.clone()));
    let directory = Arc::new(PgUserDirectory::new(&db));
    let feed: Arc<dyn TokenConfigSource> = Arc::new(PgTokenFeed::new(&db));
    let engine = Arc::new(ReconciliationEngine::new(store.clone(), directory));

    // ─────────────────────────────────────────────────────────────────────────
    // ⛓️ CHAIN ADAPTERS (partial degradation: each family is independent)
    // ─────────────────────────────────────────────────────────────────────────
    let mut treasuries: Vec<TreasuryEndpoint> = Vec::new();
    let mut adapters: Vec<Arc<dyn ChainAdapter>> = Vec::new();
    let mut scanner_configs: Vec<(Arc<dyn ChainAdapter>, ScannerConfig, Arc<Mutex<()>>)> =
        Vec::new();

    let evm_guard = Arc::new(Mutex::new(()));
    match (&cli.evm_rpc_url, &cli.evm_treasury) {
        (Some(rpc_url), Some(treasury)) => {
            let mut config = EvmClientConfig::new(&cli.evm_chain_id, rpc_url);
            config.start_block = cli.evm_start_block;
            match EvmClient::new(config) {
                Ok(client) => {
                    let adapter: Arc<dyn ChainAdapter> = Arc::new(EvmAdapter::new(client));
                    treasuries.push(TreasuryEndpoint {
                        chain_id: cli.evm_chain_id.clone(),
                        family: ChainFamily::Evm,
                        address: treasury.to_lowercase(),
                    });
                    scanner_configs.push((
                        adapter.clone(),
                        scanner_config(&cli, Duration::from_secs(cli.evm_poll_secs)),
                        evm_guard.clone(),
                    ));
                    adapters.push(adapter);
                    info!(chain = %cli.evm_chain_id, "🔗 EVM chain enabled");
                }
                Err(e) => error!(error = ?e, "❌ EVM client init failed, chain disabled"),
            }
        }
        _ => warn!("🚫 EVM chain disabled (EVM_RPC_URL/EVM_TREASURY not configured)"),
    }

    let solana_guard = Arc::new(Mutex::new(()));
    match (&cli.solana_rpc_url, &cli.solana_treasury) {
        (Some(rpc_url), Some(treasury)) => {
            let client = SolanaRpc::new(SolanaClientConfig::new(&cli.solana_chain_id, rpc_url));
            let adapter: Arc<dyn ChainAdapter> = Arc::new(SolanaAdapter::new(client));
            treasuries.push(TreasuryEndpoint {
                chain_id: cli.solana_chain_id.clone(),
                family: ChainFamily::Solana,
                address: treasury.clone(),
            });
            scanner_configs.push((
                adapter.clone(),
                scanner_config(&cli, Duration::from_secs(cli.solana_poll_secs)),
                solana_guard.clone(),
            ));
            adapters.push(adapter);
            info!(chain = %cli.solana_chain_id, "🔗 Solana chain enabled");
        }
        _ => warn!("🚫 Solana chain disabled (SOLANA_RPC_URL/SOLANA_TREASURY not configured)"),
    }

    if adapters.is_empty() {
        bail!("No chain is configured; set EVM_* and/or SOLANA_* variables");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 🪙 TOKEN CONFIGURATION
    // ─────────────────────────────────────────────────────────────────────────
    let snapshot = feed
        .fetch()
        .await
        .context("Failed to read supported-token feed")?;
    info!(tokens = snapshot.tokens.len(), "🪙 Supported tokens loaded");

    let supported = Arc::new(RwLock::new(snapshot.tokens.clone()));
    let monitored = Arc::new(RwLock::new(monitored_set(&treasuries, &snapshot.tokens)));
    let signals = Arc::new(SignalCache::new());

    // ─────────────────────────────────────────────────────────────────────────
    // ⚡ SERVICES START
    // ─────────────────────────────────────────────────────────────────────────
    let (shutdown_tx, _) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // Live subscriptions
    let manager = Arc::new(SubscriptionManager::new(
        adapters,
        engine.clone(),
        supported.clone(),
    ));
    let initial_set = monitored.read().await.clone();
    manager.register_all(&initial_set).await;

    // Token feed watcher drives re-registration on configuration changes
    let watcher = TokenFeedWatcher::new(
        feed,
        Duration::from_secs(cli.token_feed_poll_secs),
        treasuries,
        manager.clone(),
        supported.clone(),
        monitored.clone(),
        snapshot.last_modified,
    );
    let watcher_shutdown = shutdown_tx.subscribe();
    handles.push(tokio::spawn(
        async move {
            if let Err(e) = watcher.run(watcher_shutdown).await {
                match e {
                    ReconcilerError::ShutdownRequested => {}
                    e => error!(error = ?e, "❌ Token feed watcher error"),
                }
            }
        }
        .instrument(info_span!("token_feed")),
    ));

    // Catch-up scanners, one per chain, guard shared per family
    for (adapter, config, guard) in scanner_configs {
        let chain = adapter.chain_id().to_string();
        let scanner = CatchUpScanner::new(
            config,
            adapter,
            engine.clone(),
            store.clone(),
            monitored.clone(),
            supported.clone(),
            signals.clone(),
            guard,
        );
        let scanner_shutdown = shutdown_tx.subscribe();
        handles.push(tokio::spawn(
            async move {
                if let Err(e) = scanner.run(scanner_shutdown).await {
                    match e {
                        ReconcilerError::ShutdownRequested => {}
                        e => error!(error = ?e, "❌ Scanner error"),
                    }
                }
            }
            .instrument(info_span!("scanner", chain = %chain)),
        ));
    }

    // ─────────────────────────────────────────────────────────────────────────
    // ✅ READY
    // ─────────────────────────────────────────────────────────────────────────
    info!("✅ Custodia ready");
    if metrics_enabled {
        info!(
            "   📊 Metrics:  http://localhost:{}/metrics",
            cli.metrics_port
        );
    } else {
        info!("   📊 Metrics:  disabled");
    }
    info!("   Press Ctrl+C to stop");

    shutdown_signal().await;

    // ─────────────────────────────────────────────────────────────────────────
    // 🛑 SHUTDOWN
    // ─────────────────────────────────────────────────────────────────────────
    info!("🛑 Shutting down...");
    let _ = shutdown_tx.send(true);
    manager.teardown_all().await;

    for handle in handles {
        match tokio::time::timeout(Duration::from_secs(30), handle).await {
            Ok(_) => {}
            Err(_) => warn!("⚠️  Task shutdown timed out"),
        }
    }

    db.close().await;

    info!("🛑 Shutdown complete");
    Ok(())
}

/// Build a scanner configuration from the shared CLI knobs plus the
/// family's poll interval.
fn scanner_config(cli: &Cli, poll_interval: Duration) -> ScannerConfig {
    ScannerConfig {
        page_size: cli.page_size,
        page_delay: Duration::from_millis(cli.page_delay_ms),
        poll_interval,
        ..ScannerConfig::default()
    }
}

/// Initialize tracing subscriber.
fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

/// Mask password in database URL for logging.
fn mask_password(url_str: &str) -> String {
    match url::Url::parse(url_str) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => url_str.to_string(),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
