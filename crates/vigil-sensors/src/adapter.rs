use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use vigil_domain::SensorDevice;

use crate::error::SensorError;

/// One polled measurement set, ready to publish.
#[derive(Debug, Clone, Serialize)]
pub struct SensorReading {
    pub device: String,
    pub at: DateTime<Utc>,
    pub values: Value,
}

/// A protocol-specific driver for one sensor device.
///
/// The adapter is the sole authority on the device's `connection` and
/// `data_points` objects; the manager never interprets them.
#[async_trait]
pub trait SensorAdapter: Send + 'static {
    async fn connect(&mut self) -> Result<(), SensorError>;

    /// Read the configured data points once.
    async fn poll(&mut self) -> Result<Value, SensorError>;

    async fn disconnect(&mut self);
}

/// Creates adapters for one protocol. Registered with the manager per
/// [`vigil_domain::SensorProtocol`].
#[async_trait]
pub trait AdapterFactory: Send + Sync + 'static {
    fn protocol(&self) -> vigil_domain::SensorProtocol;

    fn create(&self, device: &SensorDevice) -> Result<Box<dyn SensorAdapter>, SensorError>;
}

/// Where readings go. Production wires this to the MQTT bus; tests use a
/// channel-backed publisher.
#[async_trait]
pub trait SensorPublisher: Send + Sync + 'static {
    async fn publish(&self, reading: SensorReading) -> Result<(), SensorError>;
}

/// Per-adapter health summary surfaced in the current-state report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdapterHealth {
    pub connected: bool,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_poll: Option<DateTime<Utc>>,
}
