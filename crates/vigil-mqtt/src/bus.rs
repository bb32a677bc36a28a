//! The single shared MQTT connection.
//!
//! One `rumqttc` client serves every consumer (jobs, rotation notices,
//! sensor publish, log publish). The event-loop task owns reconnection and
//! re-subscribes the whole registry on every ConnAck; publish is fan-in
//! safe because `AsyncClient` is clonable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::MqttError;
use crate::topic::topic_matches;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub device_uuid: String,
    /// Keep-alive interval; default 30s.
    pub keep_alive: Duration,
}

impl MqttSettings {
    pub fn new(host: impl Into<String>, port: u16, device_uuid: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            device_uuid: device_uuid.into(),
            keep_alive: Duration::from_secs(30),
        }
    }
}

/// A message routed out of the shared connection to one subscriber.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Cloud-initiated key rotation payload, received on
/// `device/<uuid>/config/api-key-rotation`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationNotice {
    pub event: String,
    pub new_api_key: String,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub grace_period_ends: Option<chrono::DateTime<chrono::Utc>>,
}

impl RotationNotice {
    pub fn parse(payload: &[u8]) -> Result<Self, MqttError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

type Registry = Arc<Mutex<HashMap<String, mpsc::Sender<InboundMessage>>>>;

pub struct MqttBus {
    client: AsyncClient,
    registry: Registry,
}

impl MqttBus {
    /// Connect and spawn the event-loop task. The task runs until the token
    /// cancels; transient broker failures back off and reconnect.
    pub fn connect(
        settings: MqttSettings,
        cancel: CancellationToken,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let client_id = format!("device-{}", settings.device_uuid);
        let mut options = MqttOptions::new(client_id, settings.host.clone(), settings.port);
        options.set_keep_alive(settings.keep_alive);

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));

        let task_registry = registry.clone();
        let task_client = client.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = task_client.disconnect().await;
                        return;
                    }
                    event = event_loop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt connected");
                        // Re-establish every registered subscription.
                        let filters: Vec<String> =
                            task_registry.lock().unwrap().keys().cloned().collect();
                        for filter in filters {
                            if let Err(e) =
                                task_client.subscribe(&filter, QoS::AtLeastOnce).await
                            {
                                warn!(filter, error = %e, "resubscribe failed");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        route(&task_registry, &publish.topic, publish.payload.to_vec());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt connection error, retrying");
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                        }
                    }
                }
            }
        });

        (Self { client, registry }, handle)
    }

    /// Subscribe to a filter; inbound publishes matching it arrive on the
    /// returned channel. One channel per filter.
    pub async fn subscribe(&self, filter: &str) -> Result<mpsc::Receiver<InboundMessage>, MqttError> {
        let (tx, rx) = mpsc::channel(64);
        self.registry.lock().unwrap().insert(filter.to_string(), tx);
        self.client.subscribe(filter, QoS::AtLeastOnce).await?;
        debug!(filter, "subscribed");
        Ok(rx)
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        self.registry.lock().unwrap().remove(filter);
        self.client.unsubscribe(filter).await?;
        Ok(())
    }

    /// Fan-in safe publish; callers on any task may publish concurrently.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await?;
        Ok(())
    }

    /// Graceful disconnect. Runs after every consumer has stopped.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.client.disconnect().await?;
        Ok(())
    }
}

fn route(registry: &Registry, topic: &str, payload: Vec<u8>) {
    let targets: Vec<mpsc::Sender<InboundMessage>> = {
        let guard = registry.lock().unwrap();
        guard
            .iter()
            .filter(|(filter, _)| topic_matches(filter, topic))
            .map(|(_, tx)| tx.clone())
            .collect()
    };
    if targets.is_empty() {
        debug!(topic, "no subscriber for inbound message");
        return;
    }
    for tx in targets {
        let message = InboundMessage { topic: topic.to_string(), payload: payload.clone() };
        if tx.try_send(message).is_err() {
            warn!(topic, "subscriber channel full, message dropped");
        }
    }
}
