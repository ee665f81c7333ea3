//! b402 paywall gateway server.
//!
//! # Usage
//!
//! ```bash
//! # Serve with config.toml from the current directory
//! b402-gateway serve
//!
//! # Re-apply ledger effects of confirmed receipts
//! b402-gateway --config /etc/b402/config.toml reconcile --limit 500
//!
//! # Configure logging level
//! RUST_LOG=debug b402-gateway
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to TOML configuration file (default: `config.toml`)
//! - `HOST` - Override bind address (default: `0.0.0.0`)
//! - `PORT` - Override port (default: `4021`)
//! - `DATABASE_PATH` - Override the SQLite file (default: `b402.sqlite3`)
//! - `RUST_LOG` - Log level filter (default: `info`)

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::http::Method;
use b402_gateway::app::{build_gate, verifier_registry};
use b402_gateway::util::ShutdownSignal;
use b402_gateway::{GatewayConfig, GatewayError, GatewayState, gateway_router};
use b402_sqlite::SqliteStore;
use clap::{Parser, Subcommand};
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

/// Pay-per-request gateway for x402 paywall resources.
#[derive(Debug, Parser)]
#[command(name = "b402-gateway", author, version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Apply missing ledger effects of confirmed receipts, then exit.
    Reconcile {
        /// Receipts per batch; defaults to `reconcile_batch` from the config.
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("Gateway failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), GatewayError> {
    let config = GatewayConfig::load_from(&cli.config)?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        database = %config.database_path.display(),
        "Loaded configuration"
    );

    let store = SqliteStore::open(&config.database_path)?;
    let registry = verifier_registry(&config)?;
    let gate = Arc::new(build_gate(&config, &store, &registry)?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&config, GatewayState::new(gate, store)).await,
        Command::Reconcile { limit } => {
            reconcile(&gate, limit.unwrap_or(config.reconcile_batch)).await
        }
    }
}

async fn serve(config: &GatewayConfig, state: GatewayState) -> Result<(), GatewayError> {
    let app = gateway_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let shutdown = ShutdownSignal::install()?;
    let token = shutdown.token();

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    shutdown.wait().await;
    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

/// Runs batches until one applies nothing or comes back short.
async fn reconcile(gate: &b402::GateController, limit: usize) -> Result<(), GatewayError> {
    let limit = limit.max(1);
    let (mut scanned, mut applied, mut failed) = (0, 0, 0);
    loop {
        let report = gate.reconcile(limit).await?;
        scanned += report.scanned;
        applied += report.applied;
        failed += report.failed;
        if report.applied == 0 || report.scanned < limit {
            break;
        }
    }
    tracing::info!(scanned, applied, failed, "Reconciliation finished");
    Ok(())
}
