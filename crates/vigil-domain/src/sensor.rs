use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A declaratively configured sensor or field-bus device.
///
/// `connection` and `data_points` are protocol-specific and opaque to the
/// adapter manager; only the protocol's adapter interprets them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDevice {
    pub name: String,
    pub protocol: SensorProtocol,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub connection: Value,
    #[serde(default)]
    pub data_points: Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub deployment_status: DeploymentStatus,
    #[serde(default)]
    pub last_deployed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deployment_error: Option<String>,
    #[serde(default)]
    pub deployment_attempts: u32,
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorProtocol {
    Modbus,
    Opcua,
    Can,
    /// In-process synthetic adapter, used by tests and demos.
    Virtual,
}

impl std::fmt::Display for SensorProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SensorProtocol::Modbus => "modbus",
            SensorProtocol::Opcua => "opcua",
            SensorProtocol::Can => "can",
            SensorProtocol::Virtual => "virtual",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    #[default]
    Draft,
    Pending,
    Deployed,
    Failed,
    Reconciling,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Draft => "draft",
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::Failed => "failed",
            DeploymentStatus::Reconciling => "reconciling",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sensor_device_defaults() {
        let dev: SensorDevice = serde_json::from_value(serde_json::json!({
            "name": "boiler-temp",
            "protocol": "modbus",
            "connection": {"host": "10.0.0.5", "port": 502, "unit_id": 1}
        }))
        .unwrap();
        assert!(dev.enabled);
        assert_eq!(dev.poll_interval_ms, 5_000);
        assert_eq!(dev.deployment_status, DeploymentStatus::Draft);
        assert_eq!(dev.deployment_attempts, 0);
        assert!(dev.data_points.is_null());
    }

    #[test]
    fn protocol_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SensorProtocol::Opcua).unwrap(),
            "\"opcua\""
        );
    }
}
