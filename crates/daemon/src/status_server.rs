//! Status HTTP server.
//!
//! Exposes the shared status snapshot via HTTP for the dashboard and
//! monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use std::net::SocketAddr;
use thiserror::Error;

use crate::status::{SharedStatus, StatusSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid bind address '{0}'")]
    InvalidAddress(String),
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /status endpoint
/// Returns the current StatusSnapshot as JSON
async fn get_status(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with the status endpoint
pub fn create_status_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .with_state(status)
}

/// Runs the status HTTP server on the configured bind address
///
/// # Arguments
/// * `status` - Shared status state to serve
/// * `bind_addr` - Address to listen on, e.g. "127.0.0.1:7979"
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if the address is invalid or the server fails to start
pub async fn run_status_server(status: SharedStatus, bind_addr: &str) -> Result<(), ServerError> {
    let app = create_status_router(status);
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|_| ServerError::InvalidAddress(bind_addr.to_string()))?;

    tracing::info!(%addr, "status server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
