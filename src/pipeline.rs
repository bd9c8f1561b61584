//! Turns transport messages into applied graph mutations.
//!
//! ## Ordering
//!
//! A single dispatcher drains the [`IngestQueue`] in arrival order and routes
//! each message to a worker lane chosen by hashing its path. Messages for the
//! same path therefore reach the store in receipt order, while different
//! paths are applied concurrently. Last-write-wins in the store covers the
//! case where the source itself publishes out of order.
//!
//! ## Failure handling
//!
//! - Malformed paths and invalid payloads are dropped and counted.
//! - Store failures that survive the retry budget are counted and the message
//!   is dropped; the worker moves on.
//! - Fatal errors (authentication) stop the worker and are reported on the
//!   fatal channel so the service can shut down.

use serde::{Deserialize, Serialize};
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    error::SyncError,
    mutation::MutationBuilder,
    paths::PathParser,
    payload::{now_millis, Message, PayloadRules},
    queue::IngestQueue,
    store::{ApplyReport, StoreConnectionManager},
};

const LANE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Applied(ApplyReport),
    /// Rejected before reaching the store.
    Dropped(SyncError),
    /// The store could not apply the mutations.
    Failed(SyncError),
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    applied: AtomicU64,
    stale: AtomicU64,
    malformed: AtomicU64,
    invalid_payload: AtomicU64,
    failed: AtomicU64,
    /// Epoch ms, 0 until the first message is applied.
    last_processed_at: AtomicI64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub received: u64,
    pub applied: u64,
    pub stale: u64,
    pub malformed: u64,
    pub invalid_payload: u64,
    pub failed: u64,
    pub last_processed_at: Option<i64>,
    /// Messages lost to queue backpressure. Filled in by the health monitor.
    pub backpressure_dropped: u64,
    pub queue_depth: usize,
}

impl PipelineStats {
    pub fn last_processed_at(&self) -> Option<i64> {
        match self.last_processed_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            invalid_payload: self.invalid_payload.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_processed_at: self.last_processed_at(),
            backpressure_dropped: 0,
            queue_depth: 0,
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct IngestionPipeline {
    parser: PathParser,
    rules: PayloadRules,
    builder: MutationBuilder,
    store: Arc<StoreConnectionManager>,
    stats: Arc<PipelineStats>,
    workers: usize,
}

impl IngestionPipeline {
    pub fn new(
        parser: PathParser,
        rules: PayloadRules,
        builder: MutationBuilder,
        store: Arc<StoreConnectionManager>,
        workers: usize,
    ) -> IngestionPipeline {
        IngestionPipeline {
            parser,
            rules,
            builder,
            store,
            stats: Arc::new(PipelineStats::default()),
            workers: workers.max(1),
        }
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    pub fn store(&self) -> &Arc<StoreConnectionManager> {
        &self.store
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Validate, build and apply one message. Only fatal errors are returned
    /// as `Err`; everything else is reported in the outcome.
    pub async fn process(&self, msg: Message) -> Result<ProcessOutcome, SyncError> {
        PipelineStats::bump(&self.stats.received);

        let path = match self.parser.parse(&msg.path) {
            Ok(path) => path,
            Err(e) => {
                PipelineStats::bump(&self.stats.malformed);
                tracing::warn!("[IngestionPipeline] dropped message: {e}");
                return Ok(ProcessOutcome::Dropped(e));
            }
        };
        let payload = match self.rules.parse(&msg.payload) {
            Ok(payload) => payload,
            Err(e) => {
                PipelineStats::bump(&self.stats.invalid_payload);
                tracing::warn!("[IngestionPipeline] dropped message for '{path}': {e}");
                return Ok(ProcessOutcome::Dropped(e));
            }
        };

        let set = self.builder.build(&path, payload.as_ref(), msg.received_at);
        match self.store.execute_transactional(&set).await {
            Ok(report) => {
                PipelineStats::bump(&self.stats.applied);
                if report.stale {
                    PipelineStats::bump(&self.stats.stale);
                    tracing::debug!("[IngestionPipeline] '{path}' kept newer stored value");
                }
                self.stats
                    .last_processed_at
                    .store(now_millis(), Ordering::Relaxed);
                Ok(ProcessOutcome::Applied(report))
            }
            Err(e) if e.is_fatal() => {
                PipelineStats::bump(&self.stats.failed);
                tracing::error!("[IngestionPipeline] fatal store error on '{path}': {e}");
                Err(e)
            }
            Err(e) => {
                PipelineStats::bump(&self.stats.failed);
                tracing::error!("[IngestionPipeline] could not apply '{path}': {e}");
                Ok(ProcessOutcome::Failed(e))
            }
        }
    }

    /// Spawn the dispatcher and worker lanes. They run until the queue is
    /// closed and drained, or until a worker hits a fatal error, which is
    /// sent on `fatal_tx`.
    pub fn spawn(
        self: Arc<Self>,
        queue: Arc<IngestQueue>,
        fatal_tx: mpsc::UnboundedSender<SyncError>,
    ) -> PipelineHandle {
        let mut lanes = Vec::with_capacity(self.workers);
        let mut workers = Vec::with_capacity(self.workers);

        for lane in 0..self.workers {
            let (lane_tx, mut lane_rx) = mpsc::channel::<Message>(LANE_CAPACITY);
            lanes.push(lane_tx);
            let pipeline = self.clone();
            let fatal_tx = fatal_tx.clone();
            workers.push(tokio::spawn(async move {
                while let Some(msg) = lane_rx.recv().await {
                    if let Err(e) = pipeline.process(msg).await {
                        let _ = fatal_tx.send(e);
                        break;
                    }
                }
                tracing::debug!("[IngestionPipeline] worker {lane} stopped");
            }));
        }

        let dispatcher = tokio::spawn(async move {
            tracing::info!("[IngestionPipeline] dispatching to {} workers", lanes.len());
            while let Some(msg) = queue.pop().await {
                let lane = lane_for(&msg.path, lanes.len());
                if lanes[lane].send(msg).await.is_err() {
                    tracing::warn!("[IngestionPipeline] worker {lane} is gone, stopping dispatch");
                    break;
                }
            }
            tracing::debug!("[IngestionPipeline] dispatcher stopped");
        });

        PipelineHandle {
            dispatcher,
            workers,
        }
    }
}

fn lane_for(path: &str, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() % lanes.max(1) as u64) as usize
}

pub struct PipelineHandle {
    dispatcher: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Wait for the queue to drain and in-flight messages to finish. Aborts
    /// whatever is still running after `timeout` and returns false.
    pub async fn join(self, timeout: Duration) -> bool {
        let mut aborts = vec![self.dispatcher.abort_handle()];
        aborts.extend(self.workers.iter().map(|w| w.abort_handle()));

        let all = async move {
            let _ = self.dispatcher.await;
            for worker in self.workers {
                let _ = worker.await;
            }
        };
        match tokio::time::timeout(timeout, all).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    "[IngestionPipeline] workers still busy after {timeout:?}, aborting"
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_is_stable_per_path() {
        for lanes in 1..8 {
            let lane = lane_for("site1/line1/temp", lanes);
            assert!(lane < lanes);
            assert_eq!(lane, lane_for("site1/line1/temp", lanes));
        }
    }

    #[test]
    fn test_empty_stats() {
        let stats = PipelineStats::default();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
        assert_eq!(stats.last_processed_at(), None);
    }
}
