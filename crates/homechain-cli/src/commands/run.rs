//! `homechain run` command.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use homechain_relay::{
    BusBridgeConfig, DeviceBus, HttpBridgeBus, LedgerRpcConfig, LogBus, Relay, RelayConfig,
    RpcLedgerClient,
};
use homechain_types::Cursor;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use crate::opts::GlobalOpts;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Ledger JSON-RPC endpoint (env: HOMECHAIN_LEDGER_URL)
    #[arg(long, env = "HOMECHAIN_LEDGER_URL", default_value = "http://127.0.0.1:8545")]
    pub ledger_url: String,

    /// Ledger identity whose events are relayed (env: HOMECHAIN_EMITTER)
    #[arg(long, env = "HOMECHAIN_EMITTER")]
    pub emitter: Option<String>,

    /// Device bus HTTP bridge (env: HOMECHAIN_BUS_URL)
    #[arg(long, env = "HOMECHAIN_BUS_URL", default_value = "http://127.0.0.1:18083")]
    pub bus_url: String,

    /// Bearer token for the bus bridge (env: HOMECHAIN_BUS_TOKEN)
    #[arg(long, env = "HOMECHAIN_BUS_TOKEN", hide_env_values = true)]
    pub bus_token: Option<String>,

    /// Pipeline workers (env: HOMECHAIN_WORKERS)
    #[arg(long, env = "HOMECHAIN_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Queue depth per worker (env: HOMECHAIN_QUEUE_DEPTH)
    #[arg(long, env = "HOMECHAIN_QUEUE_DEPTH", default_value_t = 64)]
    pub queue_depth: usize,

    /// Events fetched per catch-up request (env: HOMECHAIN_PAGE_SIZE)
    #[arg(long, env = "HOMECHAIN_PAGE_SIZE", default_value_t = 500)]
    pub page_size: usize,

    /// First block to process when no cursor exists (env: HOMECHAIN_GENESIS_HEIGHT)
    #[arg(long, env = "HOMECHAIN_GENESIS_HEIGHT", default_value_t = 0)]
    pub genesis_height: u64,

    /// Live subscription poll interval in milliseconds (env: HOMECHAIN_POLL_INTERVAL_MS)
    #[arg(long, env = "HOMECHAIN_POLL_INTERVAL_MS", default_value_t = 2000)]
    pub poll_interval_ms: u64,

    /// Seconds in-flight events may drain after shutdown (env: HOMECHAIN_SHUTDOWN_GRACE_SECS)
    #[arg(long, env = "HOMECHAIN_SHUTDOWN_GRACE_SECS", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Serve Prometheus metrics on this address (env: HOMECHAIN_METRICS_ADDR)
    #[arg(long, env = "HOMECHAIN_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Log commands instead of publishing them
    #[arg(long)]
    pub dry_run: bool,
}

impl RunArgs {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            emitter: self.emitter.clone().unwrap_or_default(),
            genesis_height: self.genesis_height,
            workers: self.workers,
            queue_depth: self.queue_depth,
            page_size: self.page_size,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            ..RelayConfig::default()
        }
    }

    fn ledger_config(&self) -> LedgerRpcConfig {
        LedgerRpcConfig {
            url: self.ledger_url.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            page_size: self.page_size,
            ..LedgerRpcConfig::default()
        }
    }

    fn bus_config(&self) -> BusBridgeConfig {
        BusBridgeConfig {
            url: self.bus_url.clone(),
            token: self.bus_token.clone(),
            ..BusBridgeConfig::default()
        }
    }
}

pub async fn cmd_run(opts: &GlobalOpts, args: &RunArgs) -> Result<()> {
    setup_logging();
    install_metrics(args.metrics_addr)?;

    let config = args.relay_config();
    let store = Arc::new(opts.open_store()?);
    let ledger = Arc::new(
        RpcLedgerClient::new(args.ledger_config(), config.emitter.clone())
            .context("configure ledger client")?,
    );
    let bus: Arc<dyn DeviceBus> = if args.dry_run {
        tracing::warn!("dry run: commands are logged, not published");
        Arc::new(LogBus)
    } else {
        Arc::new(HttpBridgeBus::new(args.bus_config()).context("configure device bus")?)
    };

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    // Handle Ctrl-C and SIGTERM for graceful shutdown
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, shutting down...");
            }
            _ = async {
                if let Some(ref mut t) = term { t.recv().await; }
            } => {
                tracing::info!("SIGTERM received, shutting down...");
            }
        }
        let _ = shutdown_tx.send(());
    });

    let summary = Relay::new(config, ledger, bus, store).run(shutdown_rx).await?;
    if summary.aborted_workers > 0 {
        tracing::warn!(
            aborted = summary.aborted_workers,
            "some workers were cut off; their events will be replayed on the next run"
        );
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "committed": summary.committed.map(Cursor::from),
        }))?
    );
    Ok(())
}

fn install_metrics(addr: Option<SocketAddr>) -> Result<()> {
    if let Some(addr) = addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("install prometheus exporter")?;
        tracing::info!(%addr, "metrics available at /metrics");
    }
    homechain_relay::metrics::register_metrics();
    Ok(())
}

/// Set up tracing subscriber for daemon logging.
fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();
}
