//! In-process broker for embedding the sync engine without a network broker.
//!
//! Subscription filters are matched locally with MQTT semantics. The broker
//! can also be told to refuse connections, reject credentials or drop every
//! session, which exercises the reconnect paths without a real broker.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;

use super::{Transport, TransportEvent};
use crate::{error::SyncError, paths::topic_matches, payload::Message};

#[derive(Debug)]
struct Session {
    id: u64,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Debug)]
struct BrokerState {
    sessions: Vec<Session>,
    credentials: Option<(String, String)>,
    available: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelBroker {
    state: Arc<Mutex<BrokerState>>,
    next_id: Arc<AtomicU64>,
}

impl Default for ChannelBroker {
    fn default() -> Self {
        ChannelBroker {
            state: Arc::new(Mutex::new(BrokerState {
                sessions: Vec::new(),
                credentials: None,
                available: true,
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl ChannelBroker {
    pub fn new() -> ChannelBroker {
        ChannelBroker::default()
    }

    /// Require these credentials from every client.
    pub fn with_credentials<U: Into<String>, P: Into<String>>(self, username: U, password: P) -> Self {
        self.state.lock().credentials = Some((username.into(), password.into()));
        self
    }

    /// An unavailable broker refuses new connections with a transient error.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    pub fn transport(&self) -> ChannelTransport {
        ChannelTransport {
            broker: self.clone(),
            username: None,
            password: None,
            session: None,
        }
    }

    pub fn transport_with_credentials<U: Into<String>, P: Into<String>>(
        &self,
        username: U,
        password: P,
    ) -> ChannelTransport {
        ChannelTransport {
            broker: self.clone(),
            username: Some(username.into()),
            password: Some(password.into()),
            session: None,
        }
    }

    /// Deliver to every session with a matching filter. Returns the number of
    /// sessions reached.
    pub fn publish<P: Into<String>, B: Into<Vec<u8>>>(&self, path: P, payload: B) -> usize {
        self.publish_message(Message::new(path, payload))
    }

    pub fn publish_message(&self, msg: Message) -> usize {
        let state = self.state.lock();
        let mut reached = 0;
        for session in state.sessions.iter() {
            if session.filters.iter().any(|f| topic_matches(f, &msg.path))
                && session.tx.send(TransportEvent::Message(msg.clone())).is_ok()
            {
                reached += 1;
            }
        }
        reached
    }

    /// End every session as a broker restart would.
    pub fn disconnect_all(&self, reason: &str) {
        let sessions = std::mem::take(&mut self.state.lock().sessions);
        for session in sessions {
            let _ = session
                .tx
                .send(TransportEvent::Disconnected(reason.to_string()));
        }
    }

    /// Sessions that are connected and subscribed to at least one filter.
    pub fn subscribers(&self) -> usize {
        self.state
            .lock()
            .sessions
            .iter()
            .filter(|s| !s.filters.is_empty())
            .count()
    }
}

#[derive(Debug)]
pub struct ChannelTransport {
    broker: ChannelBroker,
    username: Option<String>,
    password: Option<String>,
    session: Option<(u64, mpsc::UnboundedReceiver<TransportEvent>)>,
}

impl ChannelTransport {
    fn not_connected() -> SyncError {
        SyncError::TransientTransport("channel transport is not connected".to_string())
    }

    fn drop_session(&mut self) {
        if let Some((id, _)) = self.session.take() {
            self.broker.state.lock().sessions.retain(|s| s.id != id);
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&mut self) -> Result<(), SyncError> {
        self.drop_session();
        let mut state = self.broker.state.lock();
        if !state.available {
            return Err(SyncError::TransientTransport(
                "broker unavailable".to_string(),
            ));
        }
        if let Some((username, password)) = state.credentials.as_ref() {
            if self.username.as_ref() != Some(username) || self.password.as_ref() != Some(password) {
                return Err(SyncError::Authentication(
                    "broker refused credentials".to_string(),
                ));
            }
        }
        let id = self.broker.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state.sessions.push(Session {
            id,
            filters: Vec::new(),
            tx,
        });
        self.session = Some((id, rx));
        Ok(())
    }

    async fn subscribe(&mut self, filters: &[String]) -> Result<(), SyncError> {
        let id = match self.session.as_ref() {
            Some((id, _)) => *id,
            None => return Err(Self::not_connected()),
        };
        let mut state = self.broker.state.lock();
        match state.sessions.iter_mut().find(|s| s.id == id) {
            Some(session) => {
                session.filters = filters.to_vec();
                Ok(())
            }
            None => Err(SyncError::TransientTransport(
                "session ended before subscribing".to_string(),
            )),
        }
    }

    async fn next_event(&mut self) -> Result<TransportEvent, SyncError> {
        let Some((_, rx)) = self.session.as_mut() else {
            return Err(Self::not_connected());
        };
        let event = rx.recv().await;
        match event {
            Some(TransportEvent::Disconnected(reason)) => {
                self.drop_session();
                Ok(TransportEvent::Disconnected(reason))
            }
            Some(event) => Ok(event),
            None => {
                self.drop_session();
                Ok(TransportEvent::Disconnected("session closed".to_string()))
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), SyncError> {
        self.drop_session();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_filtered_delivery() {
        let broker = ChannelBroker::new();
        let mut transport = broker.transport();
        transport.connect().await.unwrap();
        transport
            .subscribe(&["site1/+/temp".to_string()])
            .await
            .unwrap();

        assert_eq!(broker.publish("site1/line1/temp", ""), 1);
        assert_eq!(broker.publish("site1/line1/pressure", ""), 0);
        match transport.next_event().await.unwrap() {
            TransportEvent::Message(msg) => assert_eq!(msg.path, "site1/line1/temp"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_credentials_and_availability() {
        let broker = ChannelBroker::new().with_credentials("uns", "secret");
        let mut anonymous = broker.transport();
        assert!(matches!(
            anonymous.connect().await,
            Err(SyncError::Authentication(_))
        ));

        let mut client = broker.transport_with_credentials("uns", "secret");
        broker.set_available(false);
        assert!(matches!(
            client.connect().await,
            Err(SyncError::TransientTransport(_))
        ));
        broker.set_available(true);
        client.connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_disconnect() {
        let broker = ChannelBroker::new();
        let mut transport = broker.transport();
        transport.connect().await.unwrap();
        transport.subscribe(&["#".to_string()]).await.unwrap();
        assert_eq!(broker.subscribers(), 1);

        broker.disconnect_all("restart");
        assert_eq!(
            transport.next_event().await.unwrap(),
            TransportEvent::Disconnected("restart".to_string())
        );
        assert_eq!(broker.subscribers(), 0);
        assert!(transport.next_event().await.is_err());
    }
}
