use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use fiscseq::api::{start_server, AppState, ServerConfig};
use fiscseq::audit::TracingAuditSink;
use fiscseq::codec::PrefixResolver;
use fiscseq::contracts::{AuditSink, DocumentHistory};
use fiscseq::metrics::MetricsRegistry;
use fiscseq::sequencer::Sequencer;
use fiscseq::storage::{AllocatorBackend, BackendKind, LocalStore, RocksDbHistory};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("fiscseq=info".parse()?))
        .init();

    tracing::info!("fiscseq starting...");

    // The local store holds the document history index for every backend.
    let data_dir = std::env::var("FISCSEQ_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let store = LocalStore::open(&data_dir)?;
    let history: Arc<dyn DocumentHistory> = Arc::new(RocksDbHistory::new(store.clone()));
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);
    let metrics = Arc::new(MetricsRegistry::new());

    let backend = AllocatorBackend::from_env(
        BackendKind::from_env(),
        store,
        history,
        audit,
        Arc::clone(&metrics),
    )
    .await?;
    tracing::info!(backend = %backend.describe(), "allocator ready");

    let resolver = PrefixResolver::from_env();
    if let Some(cutover) = resolver.electronic_cutover() {
        tracing::info!(%cutover, "electronic numbering cutover configured");
    }

    let sequencer = Sequencer::new(backend)
        .with_resolver(resolver)
        .with_metrics(metrics);
    let state = Arc::new(AppState::new(sequencer));

    start_server(ServerConfig::from_env(), state, shutdown_signal()).await?;

    tracing::info!("fiscseq stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
