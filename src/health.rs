use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    connection::ConnectionState,
    pipeline::{PipelineStats, StatsSnapshot},
    queue::IngestQueue,
};

/// Liveness and readiness as served on the health endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub transport_connected: bool,
    pub store_connected: bool,
    /// Epoch ms of the last applied message.
    pub last_message_processed_at: Option<i64>,
}

/// Read-only view over the connection states and pipeline counters.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    transport: ConnectionState,
    store: ConnectionState,
    stats: Arc<PipelineStats>,
    queue: Arc<IngestQueue>,
    alive: Arc<AtomicBool>,
}

impl HealthMonitor {
    pub fn new(
        transport: ConnectionState,
        store: ConnectionState,
        stats: Arc<PipelineStats>,
        queue: Arc<IngestQueue>,
    ) -> HealthMonitor {
        HealthMonitor {
            transport,
            store,
            stats,
            queue,
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn snapshot(&self) -> HealthStatus {
        HealthStatus {
            transport_connected: self.transport.is_connected(),
            store_connected: self.store.is_connected(),
            last_message_processed_at: self.stats.last_processed_at(),
        }
    }

    /// Both sides are connected.
    pub fn is_ready(&self) -> bool {
        self.transport.is_connected() && self.store.is_connected()
    }

    /// False once a fatal error was recorded or shutdown began.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self, reason: &str) {
        if self.alive.swap(false, Ordering::SeqCst) {
            tracing::info!("[HealthMonitor] no longer alive: {reason}");
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.backpressure_dropped = self.queue.dropped();
        snapshot.queue_depth = self.queue.len();
        snapshot
    }
}
