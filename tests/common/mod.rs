//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use std::{future::Future, time::Duration};
use uns_graph_sync::config::SyncConfig;

/// Defaults with millisecond retries, a fast liveness probe and no health
/// listener.
#[allow(dead_code)]
pub fn test_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 10;
    config.retry.max_attempts = 3;
    config.store.probe_interval_ms = 10;
    config.store.acquire_timeout_ms = 100;
    config.ingest.workers = 2;
    config.ingest.shutdown_timeout_ms = 2_000;
    config.health.enabled = false;
    config
}

/// Poll `check` until it returns true or `timeout` passes.
#[allow(dead_code)]
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[allow(dead_code)]
pub fn value_payload(value: serde_json::Value, timestamp: i64) -> String {
    serde_json::json!({"value": value, "timestamp": timestamp}).to_string()
}
