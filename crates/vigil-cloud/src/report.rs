//! The compact current-state report PATCHed to the control plane. Derived
//! from the current graph and adapter health so dashboards can render
//! per-service status without pulling logs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use vigil_domain::{
    AppId, DeploymentStatus, DeviceGraph, SensorDevice, ServiceErrorKind, ServiceStatus,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentStateReport {
    pub uuid: String,
    pub apps: Vec<AppReport>,
    pub adapters: Vec<AdapterReport>,
    pub errors: Vec<ErrorReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppReport {
    pub app_id: AppId,
    pub app_name: String,
    pub services: Vec<ServiceReport>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReport {
    pub service_id: i64,
    pub service_name: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterReport {
    pub name: String,
    pub deployment_status: DeploymentStatus,
    pub connected: bool,
    pub error_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_poll: Option<DateTime<Utc>>,
}

/// One entry per failing service or adapter, in the orchestrator error
/// vocabulary the dashboard renders directly.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub scope: String,
    pub kind: String,
    pub message: String,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Adapter health fields the report needs, decoupled from the sensors crate.
#[derive(Debug, Clone, Default)]
pub struct AdapterHealthView {
    pub connected: bool,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_poll: Option<DateTime<Utc>>,
}

pub fn build_report(
    uuid: &str,
    current: &DeviceGraph,
    sensors: &[SensorDevice],
    adapter_health: &HashMap<String, AdapterHealthView>,
) -> CurrentStateReport {
    let mut apps = Vec::new();
    let mut errors = Vec::new();

    let mut app_ids: Vec<AppId> = current.apps.keys().copied().collect();
    app_ids.sort();
    for app_id in app_ids {
        let app = &current.apps[&app_id];
        let services = app
            .services
            .iter()
            .map(|svc| {
                if let Some(err) = &svc.error {
                    errors.push(ErrorReport {
                        scope: format!("service:{}:{}", app_id, svc.service_id),
                        kind: err.kind.to_string(),
                        message: err.message.clone(),
                        retry_count: err.retry_count,
                        next_retry_at: err.next_retry_at,
                    });
                }
                ServiceReport {
                    service_id: svc.service_id.0,
                    service_name: svc.service_name.clone(),
                    status: svc.status,
                    container_id: svc.container_id.clone(),
                }
            })
            .collect();
        apps.push(AppReport { app_id, app_name: app.app_name.clone(), services });
    }

    let mut adapters = Vec::new();
    for device in sensors {
        let health = adapter_health.get(&device.name).cloned().unwrap_or_default();
        if device.deployment_status == DeploymentStatus::Failed {
            errors.push(ErrorReport {
                scope: format!("sensor:{}", device.name),
                kind: "AdapterFailure".to_string(),
                message: device.deployment_error.clone().unwrap_or_default(),
                retry_count: device.deployment_attempts,
                next_retry_at: None,
            });
        }
        adapters.push(AdapterReport {
            name: device.name.clone(),
            deployment_status: device.deployment_status,
            connected: health.connected,
            error_count: health.error_count,
            last_error: health.last_error,
            last_poll: health.last_poll,
        });
    }

    CurrentStateReport { uuid: uuid.to_string(), apps, adapters, errors }
}

/// Convenience: kinds a dashboard treats as image-related, used to pick
/// icons server-side. Mirrors the closed error taxonomy.
pub fn is_image_error(kind: ServiceErrorKind) -> bool {
    matches!(
        kind,
        ServiceErrorKind::ErrImagePull | ServiceErrorKind::ImagePullBackOff
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vigil_domain::{App, Service, ServiceConfig, ServiceError, ServiceId};

    fn current_with_error() -> DeviceGraph {
        let mut graph = DeviceGraph::default();
        graph.apps.insert(
            AppId(1),
            App {
                app_id: AppId(1),
                app_name: "edge".into(),
                services: vec![
                    Service {
                        service_id: ServiceId(1),
                        service_name: "web".into(),
                        image_name: "nginx:alpine".into(),
                        config: ServiceConfig::default(),
                        container_id: Some("ctr-1".into()),
                        status: ServiceStatus::Running,
                        error: None,
                    },
                    Service {
                        service_id: ServiceId(2),
                        service_name: "flows".into(),
                        image_name: "nodered:does-not-exist".into(),
                        config: ServiceConfig::default(),
                        container_id: None,
                        status: ServiceStatus::Error,
                        error: Some(ServiceError {
                            kind: ServiceErrorKind::ImagePullBackOff,
                            message: "manifest unknown".into(),
                            first_observed_at: Utc::now(),
                            retry_count: 3,
                            next_retry_at: Some(Utc::now()),
                        }),
                    },
                ],
            },
        );
        graph
    }

    #[test]
    fn errors_are_derived_from_service_state() {
        let report = build_report("uuid-1", &current_with_error(), &[], &HashMap::new());
        assert_eq!(report.apps.len(), 1);
        assert_eq!(report.apps[0].services.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, "ImagePullBackOff");
        assert_eq!(report.errors[0].retry_count, 3);
        assert_eq!(report.errors[0].scope, "service:1:2");
    }

    #[test]
    fn report_serializes_camel_case() {
        let report = build_report("uuid-1", &current_with_error(), &[], &HashMap::new());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["uuid"], "uuid-1");
        assert!(json["apps"][0]["services"][0]["serviceName"].is_string());
        assert!(json["errors"][0]["nextRetryAt"].is_string());
    }

    #[test]
    fn failed_adapter_lands_in_errors() {
        let device: SensorDevice = serde_json::from_value(serde_json::json!({
            "name": "boiler",
            "protocol": "modbus",
            "deployment_status": "failed",
            "deployment_error": "connection refused",
            "deployment_attempts": 2
        }))
        .unwrap();
        let report =
            build_report("uuid-1", &DeviceGraph::default(), &[device], &HashMap::new());
        assert_eq!(report.adapters.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].scope, "sensor:boiler");
        assert_eq!(report.errors[0].retry_count, 2);
    }
}
