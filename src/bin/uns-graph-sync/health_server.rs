//! Health endpoint for the sync service
//!
//! - `GET /health`: `200` with the [`HealthStatus`] JSON while both connections
//!   are up, `503` with the same body otherwise
//! - `GET /stats`: pipeline counters

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use std::{future::Future, net::SocketAddr};
use tower_http::trace::TraceLayer;
use uns_graph_sync::{
    health::{HealthMonitor, HealthStatus},
    pipeline::StatsSnapshot,
    SyncError,
};

pub struct HealthServer {
    addr: SocketAddr,
    monitor: HealthMonitor,
}

impl HealthServer {
    pub fn new(addr: SocketAddr, monitor: HealthMonitor) -> Self {
        Self { addr, monitor }
    }

    /// Serve until `shutdown_signal` resolves.
    pub async fn serve(
        self,
        shutdown_signal: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), SyncError> {
        let app = router(self.monitor).layer(TraceLayer::new_for_http());

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("Health endpoint listening on http://{}", self.addr);

        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown_signal)
            .await?;

        tracing::info!("Health endpoint shut down");
        Ok(())
    }
}

fn router(monitor: HealthMonitor) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(monitor)
}

async fn health_handler(State(monitor): State<HealthMonitor>) -> (StatusCode, Json<HealthStatus>) {
    let code = if monitor.is_ready() && monitor.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(monitor.snapshot()))
}

async fn stats_handler(State(monitor): State<HealthMonitor>) -> Json<StatsSnapshot> {
    Json(monitor.stats())
}
