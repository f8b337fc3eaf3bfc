mod handlers;

use std::future::Future;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::contracts::SequenceAllocator;

pub use handlers::{
    ApiError, AppState, ErrorResponse, NumberResponse, ReconcileResponse, ReserveRequest,
    SetSequenceRequest, ValidateResponse,
};

/// Creates the API router.
pub fn create_router<A: SequenceAllocator + 'static>(state: Arc<AppState<A>>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics::<A>))
        .route(
            "/entities/:entity/reservations",
            post(handlers::reserve::<A>),
        )
        .route(
            "/entities/:entity/sequences/:prefix",
            get(handlers::sequence_info::<A>).put(handlers::set_sequence::<A>),
        )
        .route(
            "/entities/:entity/sequences/:prefix/preview",
            get(handlers::preview_next::<A>),
        )
        .route(
            "/entities/:entity/sequences/:prefix/reconcile",
            post(handlers::reconcile::<A>),
        )
        .route("/fiscal-numbers/:number", get(handlers::validate_number))
        .with_state(state)
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// Reads `FISCSEQ_HOST` and `FISCSEQ_PORT`.
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            host: std::env::var("FISCSEQ_HOST").unwrap_or(default.host),
            port: std::env::var("FISCSEQ_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(default.port),
        }
    }
}

/// Starts the HTTP server.
pub async fn start_server<A, F>(
    config: ServerConfig,
    state: Arc<AppState<A>>,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    A: SequenceAllocator + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state);
    let addr = format!("{}:{}", config.host, config.port);

    tracing::info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
