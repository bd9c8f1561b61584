use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::time::Duration;
use uuid::Uuid;

use super::{Transport, TransportEvent};
use crate::{config::TransportConfig, error::SyncError, payload::Message};

const REQUEST_CAPACITY: usize = 64;
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn qos(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

/// MQTT client transport. Each `connect` builds a fresh client and event loop
/// and waits for the broker's CONNACK, so rejected credentials surface there.
pub struct MqttTransport {
    config: TransportConfig,
    client_id: String,
    session: Option<(AsyncClient, EventLoop)>,
}

impl MqttTransport {
    pub fn new(config: TransportConfig) -> MqttTransport {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("uns-graph-sync-{}", Uuid::new_v4().simple()));
        MqttTransport {
            config,
            client_id,
            session: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.config.host, self.config.port);
        options
            .set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)))
            .set_clean_session(self.config.clean_session);
        if let Some(username) = self.config.username.as_ref() {
            options.set_credentials(username, self.config.password.clone().unwrap_or_default());
        }
        options
    }

    fn not_connected() -> SyncError {
        SyncError::TransientTransport("mqtt transport is not connected".to_string())
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<(), SyncError> {
        self.session = None;
        tracing::debug!(
            "[MqttTransport] connecting to {}:{} as {}",
            self.config.host,
            self.config.port,
            self.client_id
        );
        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    tracing::debug!("[MqttTransport] connack {:?}", ack.code);
                    break;
                }
                other => tracing::trace!("[MqttTransport] before connack: {other:?}"),
            }
        }
        self.session = Some((client, eventloop));
        Ok(())
    }

    async fn subscribe(&mut self, filters: &[String]) -> Result<(), SyncError> {
        let (client, _) = self.session.as_ref().ok_or_else(Self::not_connected)?;
        for filter in filters {
            client.subscribe(filter.as_str(), qos(self.config.qos)).await?;
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<TransportEvent, SyncError> {
        let (_, eventloop) = self.session.as_mut().ok_or_else(Self::not_connected)?;
        loop {
            let event = eventloop.poll().await;
            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = Message::new(publish.topic, publish.payload.to_vec());
                    return Ok(TransportEvent::Message(msg));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    tracing::debug!("[MqttTransport] suback {:?}", ack.return_codes);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    self.session = None;
                    return Ok(TransportEvent::Disconnected(
                        "broker sent DISCONNECT".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) => {
                    self.session = None;
                    return Err(e.into());
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), SyncError> {
        let Some((client, mut eventloop)) = self.session.take() else {
            return Ok(());
        };
        client.disconnect().await?;
        // The request only leaves once the event loop is polled.
        let flushed = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            tracing::debug!("[MqttTransport] DISCONNECT not flushed within {DISCONNECT_TIMEOUT:?}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_client_id() {
        let a = MqttTransport::new(TransportConfig::default());
        let b = MqttTransport::new(TransportConfig::default());
        assert!(a.client_id().starts_with("uns-graph-sync-"));
        assert_ne!(a.client_id(), b.client_id());

        let named = MqttTransport::new(TransportConfig {
            client_id: Some("historian".to_string()),
            ..TransportConfig::default()
        });
        assert_eq!(named.client_id(), "historian");
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(2), QoS::ExactlyOnce);
    }
}
