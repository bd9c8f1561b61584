//! Connectivity state shared between a connection manager and its observers.
//!
//! Each manager owns one [`ConnectionState`] and drives it through
//! `Disconnected -> Connecting -> Connected -> Disconnecting`, with
//! `Reconnecting` while backing off after a failure. Observers such as the
//! health monitor hold clones and only read.

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    sync::Arc,
};
use tokio::sync::watch;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    /// Never connected, stopped, or retries exhausted.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    Connected,
    /// Lost the connection and backing off before the next attempt.
    Reconnecting,
    /// Graceful shutdown in progress.
    Disconnecting,
}

impl Display for ConnState {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let label = match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Reconnecting => "reconnecting",
            ConnState::Disconnecting => "disconnecting",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionState {
    component: &'static str,
    tx: Arc<watch::Sender<ConnState>>,
}

impl ConnectionState {
    pub fn new(component: &'static str) -> ConnectionState {
        let (tx, _rx) = watch::channel(ConnState::Disconnected);
        ConnectionState {
            component,
            tx: Arc::new(tx),
        }
    }

    pub fn component(&self) -> &'static str {
        self.component
    }

    pub fn set(&self, next: ConnState) {
        let previous = self.tx.send_replace(next);
        if previous != next {
            tracing::debug!("[{}] {} -> {}", self.component, previous, next);
        }
    }

    pub fn get(&self) -> ConnState {
        *self.tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.get() == ConnState::Connected
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnState> {
        self.tx.subscribe()
    }

    /// Resolve once the state satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> ConnState
    where
        F: FnMut(&ConnState) -> bool,
    {
        let mut rx = self.subscribe();
        let seen = match rx.wait_for(|state| predicate(state)).await {
            Ok(state) => *state,
            // The sender lives in self, so the channel cannot close while we wait.
            Err(_) => self.get(),
        };
        seen
    }
}
