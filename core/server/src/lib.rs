//! HTTP surface for Rollcall.
//!
//! Exposes the sync reconciler and the online desk as JSON endpoints:
//! - `POST /api/sync` for offline device uploads
//! - `POST /api/register` and `POST /api/check-in` for connected clients
//! - `GET /health`

use axum::{
    http::{header::CONTENT_TYPE, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use rollcall_common::Result;

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{CipherConfig, DatabaseConfig, NotifyArgs, ReconcileArgs, ServerConfig};
pub use error::AppError;
pub use state::AppState;

use routes::{check_in_handler, health_handler, register_handler, sync_handler};

/// Build the router over shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/api/sync", post(sync_handler))
        .route("/api/register", post(register_handler))
        .route("/api/check-in", post(check_in_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

/// Run the server until Ctrl+C or SIGTERM.
pub async fn serve(config: ServerConfig) -> Result<()> {
    info!("Initializing state...");
    let state = AppState::from_config(&config)?;

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("Server running on {}", config.bind_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
