mod config;
mod service;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use config::{BackendKind, ServerConfig};
use playerstore::backend::{Backend, MemoryBackend, SqliteBackend};
use playerstore::DataStores;
use service::StoreService;
use tokio::net::TcpListener;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;
    let _guard = init_tracing(config.log_dir.as_deref())?;

    tracing::info!("Starting playerstore server");

    match config.backend {
        BackendKind::Memory => {
            tracing::warn!("Using the in-memory backend; records are lost on exit");
            let backend = MemoryBackend::new().with_lease_ttl(config.store.lease_ttl);
            run(Arc::new(backend), config).await
        }
        BackendKind::Sqlite => {
            tracing::info!("Using data directory: {}", config.data_dir.display());
            std::fs::create_dir_all(&config.data_dir).with_context(|| {
                format!("creating data directory {}", config.data_dir.display())
            })?;
            let db_path = config.data_dir.join("playerstore.db");
            let backend = SqliteBackend::open(&db_path, config.store.lease_ttl)
                .await
                .with_context(|| format!("opening {}", db_path.display()))?;
            run(Arc::new(backend), config).await
        }
    }
}

async fn run<B: Backend>(backend: Arc<B>, config: ServerConfig) -> anyhow::Result<()> {
    let stores = DataStores::new(backend, config.store.clone());
    let service = Arc::new(StoreService::register(&stores).await?);

    let listener = TcpListener::bind(config.listen).await?;
    tracing::info!("Server listening on {}", config.listen);

    service::serve(listener, service, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Stdout logging with span durations, plus a daily rolling file when
/// `log_dir` is set. The returned guard must live until exit.
fn init_tracing(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "playerstore-server");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_span_events(FmtSpan::CLOSE))
        .with(file_layer)
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    Ok(guard)
}
