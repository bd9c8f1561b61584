//! Publish/subscribe transport seam and the connection manager that keeps a
//! subscription alive.
//!
//! The [`TransportConnectionManager`] owns the connect, subscribe and deliver
//! loop. Every message goes onto the [`IngestQueue`] under the configured
//! backpressure policy. The transport never waits on the graph store.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

use crate::{
    connection::{ConnState, ConnectionState},
    error::SyncError,
    payload::Message,
    queue::{BackpressurePolicy, IngestQueue, PushOutcome},
    retry::{Backoff, RetryPolicy},
};

pub mod channel;
#[cfg(feature = "service")]
pub mod mqtt;

pub use channel::{ChannelBroker, ChannelTransport};
#[cfg(feature = "service")]
pub use mqtt::MqttTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message(Message),
    /// The broker side ended the session.
    Disconnected(String),
}

#[async_trait]
pub trait Transport: Send + 'static {
    /// Establish a session. Rejected credentials must surface as
    /// [`SyncError::Authentication`].
    async fn connect(&mut self) -> Result<(), SyncError>;

    async fn subscribe(&mut self, filters: &[String]) -> Result<(), SyncError>;

    async fn next_event(&mut self) -> Result<TransportEvent, SyncError>;

    async fn disconnect(&mut self) -> Result<(), SyncError>;
}

enum SessionEnd {
    Shutdown,
    Lost(SyncError),
    Fatal(SyncError),
}

/// Resolves once shutdown was requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub struct TransportConnectionManager {
    filters: Vec<String>,
    policy: RetryPolicy,
    backpressure: BackpressurePolicy,
    state: ConnectionState,
}

impl TransportConnectionManager {
    pub fn new(
        filters: Vec<String>,
        policy: RetryPolicy,
        backpressure: BackpressurePolicy,
    ) -> TransportConnectionManager {
        TransportConnectionManager {
            filters,
            policy,
            backpressure,
            state: ConnectionState::new("TransportConnectionManager"),
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn filters(&self) -> &[String] {
        &self.filters
    }

    /// Keep a subscription alive until `shutdown` flips to true.
    ///
    /// Transient failures are retried with backoff. Once the retry budget is
    /// spent the connection is marked lost and retried at the capped delay
    /// for as long as the process runs. Authentication failures end the loop
    /// with an error. The queue is closed on every exit.
    pub async fn run<T: Transport>(
        &self,
        mut transport: T,
        queue: Arc<IngestQueue>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), SyncError> {
        let mut backoff = self.policy.backoff();
        self.state.set(ConnState::Connecting);

        let result = loop {
            let connected = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break Ok(()),
                res = Self::open_session(&mut transport, &self.filters) => res,
            };

            let end = match connected {
                Ok(()) => {
                    backoff.reset();
                    self.state.set(ConnState::Connected);
                    tracing::info!(
                        "[TransportConnectionManager] subscribed to {:?}",
                        self.filters
                    );
                    self.deliver(&mut transport, &queue, &mut shutdown).await
                }
                Err(e) if e.is_fatal() => SessionEnd::Fatal(e),
                Err(e) => SessionEnd::Lost(e),
            };

            match end {
                SessionEnd::Shutdown => break Ok(()),
                SessionEnd::Fatal(e) => {
                    tracing::error!("[TransportConnectionManager] fatal: {e}");
                    break Err(e);
                }
                SessionEnd::Lost(e) => {
                    if !self.back_off(&mut backoff, &e, &mut shutdown).await {
                        break Ok(());
                    }
                }
            }
        };

        self.state.set(ConnState::Disconnecting);
        if let Err(e) = transport.disconnect().await {
            tracing::debug!("[TransportConnectionManager] disconnect: {e}");
        }
        queue.close();
        self.state.set(ConnState::Disconnected);
        tracing::info!("[TransportConnectionManager] stopped");
        result
    }

    async fn open_session<T: Transport>(
        transport: &mut T,
        filters: &[String],
    ) -> Result<(), SyncError> {
        transport.connect().await?;
        transport.subscribe(filters).await
    }

    async fn deliver<T: Transport>(
        &self,
        transport: &mut T,
        queue: &IngestQueue,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
                event = transport.next_event() => event,
            };
            match event {
                Ok(TransportEvent::Message(msg)) => {
                    tracing::trace!("[TransportConnectionManager] received '{}'", msg.path);
                    match queue.push(msg, self.backpressure).await {
                        PushOutcome::Enqueued | PushOutcome::DroppedOldest(_) => {}
                        PushOutcome::Rejected(_) if queue.is_closed() => {
                            return SessionEnd::Shutdown
                        }
                        PushOutcome::Rejected(_) => {}
                    }
                }
                Ok(TransportEvent::Disconnected(reason)) => {
                    return SessionEnd::Lost(SyncError::TransientTransport(reason))
                }
                Err(e) if e.is_fatal() => return SessionEnd::Fatal(e),
                Err(e) => return SessionEnd::Lost(e),
            }
        }
    }

    /// Sleep before the next connection attempt. Returns false if shutdown
    /// was requested meanwhile.
    async fn back_off(
        &self,
        backoff: &mut Backoff,
        err: &SyncError,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let delay = match backoff.next_delay() {
            Some(delay) => {
                self.state.set(ConnState::Reconnecting);
                tracing::warn!(
                    "[TransportConnectionManager] attempt {} failed: {err}. Reconnecting in {delay:?}",
                    backoff.attempts()
                );
                delay
            }
            None => {
                self.state.set(ConnState::Disconnected);
                if backoff.attempts() == backoff.policy().max_attempts {
                    tracing::error!(
                        "[TransportConnectionManager] connection lost after {} attempts: {err}",
                        backoff.attempts()
                    );
                } else {
                    tracing::debug!("[TransportConnectionManager] still disconnected: {err}");
                }
                backoff.capped_delay()
            }
        };
        let resume = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => false,
            _ = tokio::time::sleep(delay) => true,
        };
        if resume && backoff.exhausted() {
            self.state.set(ConnState::Reconnecting);
        }
        resume
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;
    use test_log::test;

    /// Refuses every connection and records the manager state seen at each
    /// attempt.
    struct RefusingTransport {
        state: ConnectionState,
        seen: Arc<Mutex<Vec<ConnState>>>,
    }

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn connect(&mut self) -> Result<(), SyncError> {
            self.seen.lock().push(self.state.get());
            Err(SyncError::TransientTransport("connection refused".to_string()))
        }

        async fn subscribe(&mut self, _filters: &[String]) -> Result<(), SyncError> {
            Ok(())
        }

        async fn next_event(&mut self) -> Result<TransportEvent, SyncError> {
            Err(SyncError::TransientTransport("not connected".to_string()))
        }

        async fn disconnect(&mut self) -> Result<(), SyncError> {
            Ok(())
        }
    }

    #[test(tokio::test)]
    async fn test_background_attempts_report_reconnecting() {
        let manager = Arc::new(TransportConnectionManager::new(
            vec!["#".to_string()],
            RetryPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(5), 2),
            BackpressurePolicy::default(),
        ));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let transport = RefusingTransport {
            state: manager.state().clone(),
            seen: seen.clone(),
        };
        let queue = Arc::new(IngestQueue::new(4));
        let (stop_tx, stop_rx) = watch::channel(false);
        let runner = {
            let manager = manager.clone();
            let queue = queue.clone();
            tokio::spawn(async move { manager.run(transport, queue, stop_rx).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().len() < 5 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        stop_tx.send(true).unwrap();
        runner.await.unwrap().unwrap();

        let seen = seen.lock().clone();
        assert!(seen.len() >= 5, "{seen:?}");
        assert_eq!(seen[0], ConnState::Connecting);
        // Attempts after the budget is spent still go through Reconnecting.
        assert!(
            seen[1..].iter().all(|s| *s == ConnState::Reconnecting),
            "{seen:?}"
        );
        assert_eq!(manager.state().get(), ConnState::Disconnected);
        assert!(queue.is_closed());
    }
}
