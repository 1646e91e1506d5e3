//! photostash -- photo/video library server.
//!
//! Every startup reloads state from the object store: the registry
//! document and the metadata baseline are the only state there is.
//! SIGTERM/SIGINT stop accepting connections and give in-flight requests
//! `server.shutdown_timeout` seconds to finish.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};

use photostash::config::{Config, LoggingConfig};
use photostash::derive::CommandDeriver;
use photostash::storage::backend::StorageBackend;

/// Command-line arguments for the photostash server.
#[derive(Parser, Debug)]
#[command(
    name = "photostash",
    version,
    about = "Photo/video library with event-driven metadata sync"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "photostash.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default).
    Serve,
    /// Run one compaction pass and exit.
    Compact {
        /// Collection to compact; defaults to `storage.collection`.
        #[arg(long)]
        collection: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = photostash::config::load_config(&cli.config)?;
    init_tracing(&config.logging);
    info!("Loaded configuration from {}", cli.config);

    let storage = build_storage(&config).await?;

    let deriver = CommandDeriver::new(&config.derive)?;
    let missing = deriver.missing_tools();
    if !missing.is_empty() {
        warn!("Derivation tools not found on PATH: {}", missing.join(", "));
    }

    if config.observability.metrics {
        photostash::metrics::init_metrics();
        photostash::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let state = photostash::AppState::new(config.clone(), storage, Arc::new(deriver)).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Compact { collection } => {
            let collection = collection.unwrap_or_else(|| config.storage.collection.clone());
            let report = state.router.compactor().compact(&collection).await?;
            info!(
                "Compacted {}: {} segments folded, {} records",
                collection, report.segments_folded, report.records
            );
            Ok(())
        }
        Command::Serve => serve(cli.bind, config, state).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let storage: Arc<dyn StorageBackend> = match config.storage.backend.as_str() {
        "aws" => {
            let backend =
                photostash::storage::aws::AwsGatewayBackend::new(&config.storage.aws).await?;
            Arc::new(backend)
        }
        "memory" => {
            let max = config.storage.memory.max_size_bytes;
            info!("Memory storage backend initialized (max_size_bytes={})", max);
            Arc::new(photostash::storage::memory::MemoryBackend::with_limit(max))
        }
        _ => {
            let storage_root = &config.storage.local.root_dir;
            let local_backend = photostash::storage::local::LocalBackend::new(storage_root)?;
            info!("Local storage backend initialized at {}", storage_root);
            Arc::new(local_backend)
        }
    };
    Ok(storage)
}

async fn serve(
    bind: Option<String>,
    config: Config,
    state: photostash::AppState,
) -> anyhow::Result<()> {
    let bind_addr =
        bind.unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    let app = photostash::server::app(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("photostash listening on {}", bind_addr);

    let signalled = Arc::new(tokio::sync::Notify::new());
    let on_signal = signalled.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            on_signal.notify_one();
        })
        .into_future();

    let grace = Duration::from_secs(config.server.shutdown_timeout);
    let deadline = async {
        signalled.notified().await;
        tokio::time::sleep(grace).await;
    };

    tokio::select! {
        result = server => {
            result?;
            info!("photostash shut down");
        }
        () = deadline => {
            warn!("In-flight requests still running after {:?}, exiting", grace);
        }
    }
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
