//! Shared test utilities for the sync engine

use crate::{
    error::SyncError,
    mutation::MutationBuilder,
    paths::PathParser,
    payload::{Message, PayloadRules},
    pipeline::IngestionPipeline,
    retry::RetryPolicy,
    store::{
        ApplyReport, GraphStore, MemoryGraphStore, NamespaceNode, StoreConnectionManager,
    },
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

/// Three attempts with millisecond delays.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(5), 3)
}

pub fn value_message(path: &str, value: serde_json::Value, timestamp: i64) -> Message {
    let payload = serde_json::json!({"value": value, "timestamp": timestamp});
    Message::new(path, payload.to_string()).with_received_at(timestamp)
}

/// Memory store that can be told to fail.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryGraphStore,
    pending_failures: AtomicU32,
    failure: Mutex<Option<SyncError>>,
    down: AtomicBool,
    reject_credentials: AtomicBool,
    apply_calls: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Arc<FlakyStore> {
        Arc::new(FlakyStore::default())
    }

    /// Fail the next `count` applies with `err`.
    pub fn fail_next(&self, count: u32, err: SyncError) {
        *self.failure.lock() = Some(err);
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// While down, connect and apply fail with a transient error.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    pub fn reject_credentials(&self) {
        self.reject_credentials.store(true, Ordering::SeqCst);
    }

    pub fn apply_calls(&self) -> u32 {
        self.apply_calls.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryGraphStore {
        &self.inner
    }

    fn unreachable() -> SyncError {
        SyncError::TransientStore("connection refused".to_string())
    }
}

#[async_trait]
impl GraphStore for FlakyStore {
    async fn connect(&self) -> Result<(), SyncError> {
        if self.reject_credentials.load(Ordering::SeqCst) {
            return Err(SyncError::Authentication("bad store credentials".to_string()));
        }
        if self.down.load(Ordering::SeqCst) {
            return Err(Self::unreachable());
        }
        self.inner.connect().await
    }

    async fn apply(&self, set: &crate::mutation::MutationSet) -> Result<ApplyReport, SyncError> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(Self::unreachable());
        }
        let remaining = self.pending_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.pending_failures.store(remaining - 1, Ordering::SeqCst);
            if let Some(err) = self.failure.lock().clone() {
                return Err(err);
            }
        }
        self.inner.apply(set).await
    }

    async fn node(&self, path: &str) -> Result<Option<NamespaceNode>, SyncError> {
        self.inner.node(path).await
    }

    async fn parent_of(&self, path: &str) -> Result<Option<String>, SyncError> {
        self.inner.parent_of(path).await
    }

    async fn counts(&self) -> Result<(usize, usize), SyncError> {
        self.inner.counts().await
    }

    async fn tree_violations(&self) -> Result<Vec<String>, SyncError> {
        self.inner.tree_violations().await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

pub fn manager_for(store: Arc<dyn GraphStore>) -> Arc<StoreConnectionManager> {
    Arc::new(StoreConnectionManager::new(
        store,
        fast_policy(),
        2,
        Duration::from_millis(50),
    ))
}

pub fn pipeline_for(store: Arc<dyn GraphStore>) -> IngestionPipeline {
    IngestionPipeline::new(
        PathParser::default(),
        PayloadRules::default(),
        MutationBuilder::default(),
        manager_for(store),
        2,
    )
}
