//! Plan computation: diff the target graph against the current graph and
//! produce an ordered sequence of typed steps.
//!
//! The phase order is a hard contract: images, then volumes, then networks,
//! then stops and removals, then starts, then teardown of orphaned networks
//! and volumes.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use vigil_domain::{AppId, DeviceGraph, Service, ServiceId, ServiceStatus, VolumeRef};

/// One reconciliation step. A closed sum so planning and reporting stay
/// exhaustive at compile time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    DownloadImage { image: String },
    CreateVolume { app_id: AppId, name: String },
    CreateNetwork { name: String },
    StopContainer { app_id: AppId, service_id: ServiceId, container_id: String },
    RemoveContainer { app_id: AppId, service_id: ServiceId, container_id: String },
    StartContainer { app_id: AppId, service_id: ServiceId },
    RemoveNetwork { name: String },
    RemoveVolume { name: String },
}

impl Step {
    /// Phase index per the ordering contract.
    pub fn phase(&self) -> u8 {
        match self {
            Step::DownloadImage { .. } => 1,
            Step::CreateVolume { .. } => 2,
            Step::CreateNetwork { .. } => 3,
            Step::StopContainer { .. } => 4,
            Step::RemoveContainer { .. } => 5,
            Step::StartContainer { .. } => 6,
            Step::RemoveNetwork { .. } => 7,
            Step::RemoveVolume { .. } => 8,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Step::DownloadImage { image } => write!(f, "downloadImage({})", image),
            Step::CreateVolume { name, .. } => write!(f, "createVolume({})", name),
            Step::CreateNetwork { name } => write!(f, "createNetwork({})", name),
            Step::StopContainer { app_id, service_id, .. } => {
                write!(f, "stopContainer({}:{})", app_id, service_id)
            }
            Step::RemoveContainer { app_id, service_id, .. } => {
                write!(f, "removeContainer({}:{})", app_id, service_id)
            }
            Step::StartContainer { app_id, service_id } => {
                write!(f, "startContainer({}:{})", app_id, service_id)
            }
            Step::RemoveNetwork { name } => write!(f, "removeNetwork({})", name),
            Step::RemoveVolume { name } => write!(f, "removeVolume({})", name),
        }
    }
}

/// Whether the running container for `current` no longer matches `target`.
/// Compares image and the full service config: ports, env, volumes,
/// networks, resources and probe configuration.
pub fn service_drifted(target: &Service, current: &Service) -> bool {
    target.image_name != current.image_name || target.config != current.config
}

/// Managed (named) volume docker names referenced by a graph. Bind mounts
/// are excluded by construction.
fn named_volumes(graph: &DeviceGraph) -> BTreeMap<String, AppId> {
    let mut out = BTreeMap::new();
    for (app_id, service) in graph.services() {
        for vol in service.config.volume_refs() {
            if let Some(name) = vol.mount_name(app_id) {
                out.insert(name, app_id);
            }
        }
    }
    out
}

fn networks(graph: &DeviceGraph) -> BTreeSet<String> {
    graph
        .services()
        .flat_map(|(_, s)| s.config.networks.iter().cloned())
        .collect()
}

/// True if a target service needs a (re)start: it has no live container in
/// `current`, or its config drifted.
fn needs_start(target: &Service, current: Option<&Service>) -> bool {
    match current {
        None => true,
        Some(cur) => {
            cur.container_id.is_none()
                || cur.status != ServiceStatus::Running
                || service_drifted(target, cur)
        }
    }
}

/// Compute the ordered step plan moving `current` toward `target`.
pub fn calculate_steps(target: &DeviceGraph, current: &DeviceGraph) -> Vec<Step> {
    let mut steps = Vec::new();

    let current_by_identity: BTreeMap<(AppId, ServiceId), &Service> = current
        .services()
        .map(|(app_id, s)| ((app_id, s.service_id), s))
        .collect();
    let target_by_identity: BTreeMap<(AppId, ServiceId), &Service> = target
        .services()
        .map(|(app_id, s)| ((app_id, s.service_id), s))
        .collect();

    // Services that need a fresh container this cycle.
    let to_start: BTreeMap<(AppId, ServiceId), &Service> = target_by_identity
        .iter()
        .filter(|((app_id, sid), svc)| {
            needs_start(svc, current_by_identity.get(&(*app_id, *sid)).copied())
        })
        .map(|(k, v)| (*k, *v))
        .collect();

    // Phase 1: one download per distinct image needed by a starting service.
    let images: BTreeSet<&str> = to_start.values().map(|s| s.image_name.as_str()).collect();
    for image in images {
        steps.push(Step::DownloadImage { image: image.to_string() });
    }

    // Phases 2-3: volumes and networks present in target but not current.
    let target_volumes = named_volumes(target);
    let current_volumes = named_volumes(current);
    for (name, app_id) in &target_volumes {
        if !current_volumes.contains_key(name) {
            steps.push(Step::CreateVolume { app_id: *app_id, name: name.clone() });
        }
    }
    let target_networks = networks(target);
    let current_networks = networks(current);
    for name in target_networks.difference(&current_networks) {
        steps.push(Step::CreateNetwork { name: name.clone() });
    }

    // Phases 4-5: stop then remove containers that drifted or left the target.
    let mut to_remove: Vec<(AppId, ServiceId, String)> = Vec::new();
    for ((app_id, sid), cur) in &current_by_identity {
        let Some(container_id) = cur.container_id.clone() else { continue };
        let gone = !target_by_identity.contains_key(&(*app_id, *sid));
        let drifted = target_by_identity
            .get(&(*app_id, *sid))
            .map(|t| service_drifted(t, cur))
            .unwrap_or(false);
        // A dead container for a still-wanted service is replaced, not
        // started around; the name would collide otherwise.
        let stalled = !gone && cur.status != ServiceStatus::Running;
        if gone || drifted || stalled {
            to_remove.push((*app_id, *sid, container_id));
        }
    }
    for (app_id, service_id, container_id) in &to_remove {
        steps.push(Step::StopContainer {
            app_id: *app_id,
            service_id: *service_id,
            container_id: container_id.clone(),
        });
    }
    for (app_id, service_id, container_id) in &to_remove {
        steps.push(Step::RemoveContainer {
            app_id: *app_id,
            service_id: *service_id,
            container_id: container_id.clone(),
        });
    }

    // Phase 6: starts.
    for (app_id, service_id) in to_start.keys() {
        steps.push(Step::StartContainer { app_id: *app_id, service_id: *service_id });
    }

    // Phases 7-8: orphaned networks and volumes, teardown last.
    for name in current_networks.difference(&target_networks) {
        steps.push(Step::RemoveNetwork { name: name.clone() });
    }
    for name in current_volumes.keys() {
        if !target_volumes.contains_key(name) {
            steps.push(Step::RemoveVolume { name: name.clone() });
        }
    }

    steps
}

/// Labels stamped on every managed runtime object.
pub fn managed_labels(app_id: AppId) -> std::collections::HashMap<String, String> {
    let mut labels = std::collections::HashMap::new();
    labels.insert(vigil_runtime::MANAGED_LABEL.to_string(), "true".to_string());
    labels.insert("app-id".to_string(), app_id.to_string());
    labels
}

/// Resolve a service's volume references against its app id, dropping
/// nothing: bind mounts pass through verbatim, named volumes get the
/// app-scoped docker name.
pub fn bind_strings(app_id: AppId, service: &Service) -> Vec<String> {
    service
        .config
        .volume_refs()
        .iter()
        .map(|v: &VolumeRef| v.bind_string(app_id))
        .collect()
}
