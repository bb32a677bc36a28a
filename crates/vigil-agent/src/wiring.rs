//! Glue between the cloud loops and the local managers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use vigil_cloud::report::{build_report, AdapterHealthView};
use vigil_cloud::{CurrentStateReport, ReportSource, TargetHandler};
use vigil_domain::DeviceGraph;
use vigil_engine::ContainerManager;
use vigil_mqtt::{sensor_topic, MqttBus};
use vigil_sensors::{AdapterManager, SensorError, SensorPublisher, SensorReading};

/// Fans a polled target document out to the container manager and the
/// adapter manager.
pub struct TargetFanout {
    pub engine: Arc<ContainerManager>,
    pub sensors: Arc<AdapterManager>,
}

#[async_trait]
impl TargetHandler for TargetFanout {
    async fn apply_target(&self, graph: DeviceGraph) {
        if graph.config.features.protocol_adapters {
            self.sensors.reconcile(graph.sensors.clone());
        } else {
            // Feature switched off: tear every adapter down.
            self.sensors.reconcile(Vec::new());
        }
        if let Err(e) = self.engine.set_target(graph).await {
            warn!(error = %e, "applying target state failed");
        }
    }
}

/// Assembles the periodic current-state report.
pub struct ReportBundle {
    pub uuid: String,
    pub engine: Arc<ContainerManager>,
    pub sensors: Arc<AdapterManager>,
}

#[async_trait]
impl ReportSource for ReportBundle {
    async fn current_report(&self) -> CurrentStateReport {
        let current = self.engine.current_graph().await;
        let devices = self.sensors.devices();
        let health: HashMap<String, AdapterHealthView> = self
            .sensors
            .health()
            .into_iter()
            .map(|(name, h)| {
                (
                    name,
                    AdapterHealthView {
                        connected: h.connected,
                        error_count: h.error_count,
                        last_error: h.last_error,
                        last_poll: h.last_poll,
                    },
                )
            })
            .collect();
        build_report(&self.uuid, &current, &devices, &health)
    }
}

/// Publishes sensor readings on the shared MQTT connection.
pub struct MqttSensorPublisher {
    pub bus: Arc<MqttBus>,
    pub base_topic: String,
}

#[async_trait]
impl SensorPublisher for MqttSensorPublisher {
    async fn publish(&self, reading: SensorReading) -> Result<(), SensorError> {
        let topic = sensor_topic(&self.base_topic, &reading.device);
        let payload = serde_json::to_vec(&reading)
            .map_err(|e| SensorError::PublishFailed(e.to_string()))?;
        self.bus
            .publish(&topic, payload)
            .await
            .map_err(|e| SensorError::PublishFailed(e.to_string()))
    }
}

/// Offline fallback: readings are logged and discarded.
pub struct NullSensorPublisher;

#[async_trait]
impl SensorPublisher for NullSensorPublisher {
    async fn publish(&self, reading: SensorReading) -> Result<(), SensorError> {
        debug!(device = %reading.device, "sensor reading (no publisher configured)");
        Ok(())
    }
}
