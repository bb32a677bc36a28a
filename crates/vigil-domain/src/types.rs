use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::probe::Probe;
use crate::resources::Resources;

// ── Identifiers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppId(pub i64);

impl AppId {
    pub fn new(id: i64) -> Self {
        AppId(id)
    }
}

impl std::fmt::Display for AppId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub i64);

impl ServiceId {
    pub fn new(id: i64) -> Self {
        ServiceId(id)
    }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Device graph ─────────────────────────────────────────────────────────────

/// The full declarative state of one device: applications plus device-level
/// feature flags and tunables. Both the cloud-declared target and the agent's
/// observed current state use this shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceGraph {
    #[serde(default)]
    pub apps: HashMap<AppId, App>,
    #[serde(default)]
    pub config: DeviceConfig,
    /// Declarative sensor/protocol devices; consumed by the adapter
    /// manager, opaque to container reconciliation.
    #[serde(default)]
    pub sensors: Vec<crate::sensor::SensorDevice>,
}

impl DeviceGraph {
    /// Iterate every service in every app as `(app_id, &service)`.
    pub fn services(&self) -> impl Iterator<Item = (AppId, &Service)> {
        self.apps
            .values()
            .flat_map(|app| app.services.iter().map(move |s| (app.app_id, s)))
    }

    pub fn service(&self, app_id: AppId, service_id: ServiceId) -> Option<&Service> {
        self.apps
            .get(&app_id)
            .and_then(|app| app.services.iter().find(|s| s.service_id == service_id))
    }

    pub fn service_mut(&mut self, app_id: AppId, service_id: ServiceId) -> Option<&mut Service> {
        self.apps
            .get_mut(&app_id)
            .and_then(|app| app.services.iter_mut().find(|s| s.service_id == service_id))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub features: FeatureFlags,
    #[serde(default = "default_reconcile_interval_ms")]
    pub reconcile_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

fn default_reconcile_interval_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    60_000
}

fn default_report_interval_ms() -> u64 {
    10_000
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            features: FeatureFlags::default(),
            reconcile_interval_ms: default_reconcile_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

/// Device-level enable/disable switches for optional subsystems.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub remote_access: bool,
    #[serde(default = "default_true")]
    pub jobs: bool,
    #[serde(default = "default_true")]
    pub sensor_publish: bool,
    #[serde(default = "default_true")]
    pub protocol_adapters: bool,
    #[serde(default)]
    pub shadow: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            remote_access: false,
            jobs: true,
            sensor_publish: true,
            protocol_adapters: true,
            shadow: false,
        }
    }
}

// ── App ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub app_id: AppId,
    pub app_name: String,
    /// Order within an app is not semantic; identity is `service_id`.
    #[serde(default)]
    pub services: Vec<Service>,
}

// ── Service ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub service_id: ServiceId,
    pub service_name: String,
    pub image_name: String,
    #[serde(default)]
    pub config: ServiceConfig,
    /// Runtime-assigned id; present iff a container currently exists.
    #[serde(default)]
    pub container_id: Option<String>,
    #[serde(default)]
    pub status: ServiceStatus,
    #[serde(default)]
    pub error: Option<ServiceError>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Raw volume reference strings; parse with [`crate::VolumeRef::parse`].
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub resources: Option<Resources>,
    #[serde(default)]
    pub liveness_probe: Option<Probe>,
    #[serde(default)]
    pub readiness_probe: Option<Probe>,
    #[serde(default)]
    pub startup_probe: Option<Probe>,
    #[serde(default)]
    pub restart: RestartPolicy,
}

impl ServiceConfig {
    /// Parsed volume references, skipping strings that fail to parse.
    /// Callers that need parse errors use `VolumeRef::parse` directly.
    pub fn volume_refs(&self) -> Vec<crate::VolumeRef> {
        self.volumes
            .iter()
            .filter_map(|v| crate::VolumeRef::parse(v).ok())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    Always,
    UnlessStopped,
    OnFailure,
    No,
}

// ── Port mapping ─────────────────────────────────────────────────────────────

/// `"HOST:CONTAINER"` or `"HOST:CONTAINER/udp"`. Serialized in string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
    pub protocol: String,
}

impl PortMapping {
    pub fn tcp(host: u16, container: u16) -> Self {
        Self { host, container, protocol: "tcp".to_string() }
    }
}

impl FromStr for PortMapping {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (mapping, protocol) = match s.split_once('/') {
            Some((m, p)) => (m, p),
            None => (s, "tcp"),
        };
        let (host, container) = mapping
            .split_once(':')
            .ok_or_else(|| DomainError::InvalidPortMapping(s.to_string()))?;
        let host = host
            .parse()
            .map_err(|_| DomainError::InvalidPortMapping(s.to_string()))?;
        let container = container
            .parse()
            .map_err(|_| DomainError::InvalidPortMapping(s.to_string()))?;
        Ok(Self { host, container, protocol: protocol.to_string() })
    }
}

impl std::fmt::Display for PortMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.protocol == "tcp" {
            write!(f, "{}:{}", self.host, self.container)
        } else {
            write!(f, "{}:{}/{}", self.host, self.container, self.protocol)
        }
    }
}

impl Serialize for PortMapping {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortMapping {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── Status & errors ──────────────────────────────────────────────────────────

/// Transitions: Pending → Running → Stopped | Error.
/// Running → Error only through an observed failure event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Pending,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceStatus::Pending => "pending",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// The orchestrator-vocabulary error classes surfaced per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ServiceErrorKind {
    /// Transient image fetch failure before the backoff threshold.
    ErrImagePull,
    /// One or more failed pulls; `next_retry_at` is populated.
    ImagePullBackOff,
    /// Container creation or start returned an error.
    StartFailure,
    /// Repeated liveness-driven restarts within a short window.
    CrashLoopBackOff,
}

impl std::fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceErrorKind::ErrImagePull => "ErrImagePull",
            ServiceErrorKind::ImagePullBackOff => "ImagePullBackOff",
            ServiceErrorKind::StartFailure => "StartFailure",
            ServiceErrorKind::CrashLoopBackOff => "CrashLoopBackOff",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
    pub first_observed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_mapping_parses_and_round_trips() {
        let p: PortMapping = "8085:80".parse().unwrap();
        assert_eq!(p.host, 8085);
        assert_eq!(p.container, 80);
        assert_eq!(p.protocol, "tcp");
        assert_eq!(p.to_string(), "8085:80");

        let u: PortMapping = "5683:5683/udp".parse().unwrap();
        assert_eq!(u.protocol, "udp");
        assert_eq!(u.to_string(), "5683:5683/udp");
    }

    #[test]
    fn port_mapping_rejects_garbage() {
        assert!("80".parse::<PortMapping>().is_err());
        assert!("a:b".parse::<PortMapping>().is_err());
    }

    #[test]
    fn port_mapping_serde_uses_string_form() {
        let p = PortMapping::tcp(8080, 80);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"8080:80\"");
        let back: PortMapping = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn device_graph_parses_partial_document() {
        // A minimal cloud document: missing config and most service fields.
        let doc = serde_json::json!({
            "apps": {
                "1": {
                    "app_id": 1,
                    "app_name": "monitoring",
                    "services": [{
                        "service_id": 1,
                        "service_name": "web",
                        "image_name": "nginx:alpine"
                    }]
                }
            }
        });
        let graph: DeviceGraph = serde_json::from_value(doc).unwrap();
        assert_eq!(graph.apps.len(), 1);
        let (app_id, svc) = graph.services().next().unwrap();
        assert_eq!(app_id, AppId(1));
        assert_eq!(svc.status, ServiceStatus::Pending);
        assert!(svc.container_id.is_none());
        assert_eq!(graph.config.reconcile_interval_ms, 30_000);
    }

    #[test]
    fn service_lookup_by_identity() {
        let mut graph = DeviceGraph::default();
        graph.apps.insert(
            AppId(1),
            App {
                app_id: AppId(1),
                app_name: "a".into(),
                services: vec![Service {
                    service_id: ServiceId(7),
                    service_name: "web".into(),
                    image_name: "nginx:alpine".into(),
                    config: ServiceConfig::default(),
                    container_id: None,
                    status: ServiceStatus::Pending,
                    error: None,
                }],
            },
        );
        assert!(graph.service(AppId(1), ServiceId(7)).is_some());
        assert!(graph.service(AppId(1), ServiceId(8)).is_none());
        assert!(graph.service(AppId(2), ServiceId(7)).is_none());
    }
}
