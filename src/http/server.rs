//! HTTP server wiring.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{StatusCode, Uri};
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit_middleware, Gatekeeper};
use crate::error::{Result, TurnstileError};

/// Routes the service answers itself: a health check under `health_path`
/// and a JSON 404 for everything else.
pub fn service_routes(health_path: &str) -> Router {
    Router::new()
        .route(health_path, get(health))
        .fallback(not_found)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "not_found",
            "message": format!("No route for {}", uri.path()),
        })),
    )
}

/// Put every route of `router` behind the gate.
pub fn protect(router: Router, gate: Arc<Gatekeeper>) -> Router {
    router.layer(from_fn_with_state(gate, rate_limit_middleware))
}

/// HTTP server for a gated router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    router: Router,
}

impl HttpServer {
    /// Create a server that serves `router` behind `gate`.
    pub fn new(addr: SocketAddr, router: Router, gate: Arc<Gatekeeper>) -> Self {
        Self {
            addr,
            router: protect(router, gate),
        }
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    ///
    /// Peer addresses are exposed to the gate through `ConnectInfo`.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            TurnstileError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Io(e)
        })
    }
}
