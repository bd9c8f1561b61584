//! # Sync service
//!
//! [`SyncService`] wires the components together and owns their tasks:
//!
//! 1. **Transport task** ([`TransportConnectionManager::run`])
//!    - Connects, subscribes and reconnects with backoff
//!    - Pushes every message onto the bounded [`IngestQueue`]
//!
//! 2. **Pipeline tasks** ([`IngestionPipeline::spawn`])
//!    - One dispatcher routing by path hash onto worker lanes
//!    - Workers validate, build mutation sets and apply them through the
//!      [`StoreConnectionManager`]
//!
//! 3. **Liveness probe** ([`StoreConnectionManager::spawn_liveness_probe`])
//!    - Reconnects the store in the background while it is unreachable
//!
//! ## Shutdown
//!
//! [`SyncService::shutdown`] stops in order: the transport (no new messages,
//! queue closed), then the workers (queue drained within the shutdown
//! timeout), then the store sessions.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use uns_graph_sync::{
//!     config::SyncConfig,
//!     service::SyncService,
//!     store::MemoryGraphStore,
//!     transport::ChannelBroker,
//! };
//!
//! # async fn run() -> Result<(), uns_graph_sync::SyncError> {
//! let broker = ChannelBroker::new();
//! let mut service = SyncService::new(
//!     SyncConfig::default(),
//!     Arc::new(MemoryGraphStore::new()),
//!     broker.transport(),
//! )?;
//! service.start().await?;
//! broker.publish("site1/line1/temp", r#"{"value": 72.5, "timestamp": 1}"#);
//! service.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::SyncConfig,
    error::SyncError,
    health::HealthMonitor,
    pipeline::{IngestionPipeline, PipelineHandle, StatsSnapshot},
    queue::IngestQueue,
    store::{GraphStore, StoreConnectionManager},
    transport::{Transport, TransportConnectionManager},
};

#[cfg(feature = "service")]
use crate::{store::SqliteGraphStore, transport::MqttTransport};

/// Requests a graceful shutdown from any thread, e.g. a signal handler.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        if !self.0.send_replace(true) {
            tracing::info!("[SyncService] shutdown requested");
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once shutdown was triggered.
    pub async fn wait(&self) {
        let mut rx = self.0.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

struct RunningTasks {
    transport: JoinHandle<()>,
    pipeline: PipelineHandle,
    probe: JoinHandle<()>,
}

pub struct SyncService<T: Transport> {
    config: SyncConfig,
    store: Arc<StoreConnectionManager>,
    transport: Option<T>,
    transport_manager: Arc<TransportConnectionManager>,
    pipeline: Arc<IngestionPipeline>,
    queue: Arc<IngestQueue>,
    health: HealthMonitor,
    shutdown: ShutdownHandle,
    fatal_tx: mpsc::UnboundedSender<SyncError>,
    fatal_rx: mpsc::UnboundedReceiver<SyncError>,
    tasks: Option<RunningTasks>,
}

#[cfg(feature = "service")]
impl SyncService<MqttTransport> {
    /// SQLite store at `store.path` and an MQTT transport, as configured.
    pub async fn open(config: SyncConfig) -> Result<Self, SyncError> {
        let store = SqliteGraphStore::open(config.store.path.clone(), config.store.pool_size as u32)
            .await?;
        let transport = MqttTransport::new(config.transport.clone());
        tracing::info!(
            "[SyncService] mqtt client id {} for {}:{}",
            transport.client_id(),
            config.transport.host,
            config.transport.port
        );
        SyncService::new(config, Arc::new(store), transport)
    }
}

impl<T: Transport> SyncService<T> {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn GraphStore>,
        transport: T,
    ) -> Result<SyncService<T>, SyncError> {
        config.validate()?;
        let policy = config.retry_policy();
        let store = Arc::new(StoreConnectionManager::new(
            store,
            policy.clone(),
            config.store.pool_size,
            config.store.acquire_timeout(),
        ));
        let transport_manager = Arc::new(TransportConnectionManager::new(
            config.transport.topics.clone(),
            policy,
            config.backpressure_policy(),
        ));
        let pipeline = Arc::new(IngestionPipeline::new(
            config.path_parser(),
            config.payload_rules(),
            config.mutation_builder(),
            store.clone(),
            config.ingest.workers,
        ));
        let queue = Arc::new(IngestQueue::new(config.ingest.queue_capacity));
        let health = HealthMonitor::new(
            transport_manager.state().clone(),
            store.state().clone(),
            pipeline.stats().clone(),
            queue.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        Ok(SyncService {
            config,
            store,
            transport: Some(transport),
            transport_manager,
            pipeline,
            queue,
            health,
            shutdown: ShutdownHandle(Arc::new(shutdown_tx)),
            fatal_tx,
            fatal_rx,
            tasks: None,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn health(&self) -> HealthMonitor {
        self.health.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.health.stats()
    }

    pub fn store(&self) -> &Arc<StoreConnectionManager> {
        &self.store
    }

    pub fn transport_manager(&self) -> &Arc<TransportConnectionManager> {
        &self.transport_manager
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Connect the store and spawn the pipeline, transport and probe tasks.
    ///
    /// An unreachable store is not fatal here: the service starts degraded
    /// and the liveness probe keeps reconnecting. Rejected credentials are.
    pub async fn start(&mut self) -> Result<(), SyncError> {
        let Some(transport) = self.transport.take() else {
            return Err(SyncError::Config("service already started".to_string()));
        };
        tracing::info!(
            "[SyncService] starting with {} workers, queue capacity {}",
            self.pipeline.workers(),
            self.queue.capacity()
        );

        match self.store.start().await {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                self.health.mark_dead(&e.to_string());
                return Err(e);
            }
            Err(e) => tracing::warn!("[SyncService] starting without a store connection: {e}"),
        }

        let pipeline = self.pipeline.clone().spawn(self.queue.clone(), self.fatal_tx.clone());

        let manager = self.transport_manager.clone();
        let queue = self.queue.clone();
        let shutdown_rx = self.shutdown.0.subscribe();
        let fatal_tx = self.fatal_tx.clone();
        let transport_task = tokio::spawn(async move {
            if let Err(e) = manager.run(transport, queue, shutdown_rx).await {
                let _ = fatal_tx.send(e);
            }
        });

        let probe = self
            .store
            .spawn_liveness_probe(self.config.store.probe_interval(), self.shutdown.0.subscribe());

        self.tasks = Some(RunningTasks {
            transport: transport_task,
            pipeline,
            probe,
        });
        Ok(())
    }

    /// Resolve with the first fatal error, or `Ok` once shutdown was requested.
    pub async fn wait(&mut self) -> Result<(), SyncError> {
        let mut shutdown_rx = self.shutdown.0.subscribe();
        tokio::select! {
            fatal = self.fatal_rx.recv() => match fatal {
                Some(e) => {
                    tracing::error!("[SyncService] fatal error: {e}");
                    self.health.mark_dead(&e.to_string());
                    Err(e)
                }
                None => Ok(()),
            },
            _ = shutdown_rx.wait_for(|stop| *stop) => Ok(()),
        }
    }

    /// Stop the transport, drain the workers, then release the store.
    pub async fn shutdown(&mut self) -> Result<(), SyncError> {
        self.health.mark_dead("shutdown");
        self.shutdown.trigger();
        let timeout = self.config.ingest.shutdown_timeout();

        if let Some(tasks) = self.tasks.take() {
            let transport_abort = tasks.transport.abort_handle();
            if tokio::time::timeout(timeout, tasks.transport).await.is_err() {
                tracing::warn!("[SyncService] transport did not stop within {timeout:?}");
                transport_abort.abort();
                self.queue.close();
            }

            if !tasks.pipeline.join(timeout).await {
                tracing::warn!(
                    "[SyncService] {} queued messages were not applied",
                    self.queue.len()
                );
            }
            let _ = tasks.probe.await;
        }

        self.store.stop(timeout).await;
        let stats = self.health.stats();
        tracing::info!(
            "[SyncService] stopped. received: {}, applied: {}, stale: {}, dropped: {}, failed: {}",
            stats.received,
            stats.applied,
            stats.stale,
            stats.malformed + stats.invalid_payload + stats.backpressure_dropped,
            stats.failed
        );
        Ok(())
    }
}
