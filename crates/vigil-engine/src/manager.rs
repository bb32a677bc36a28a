//! The container manager: holds the target and current graphs, computes the
//! ordered plan, executes it with per-step error isolation, and reacts to
//! liveness failures with controlled restarts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_domain::{
    App, AppId, DeviceGraph, Service, ServiceError, ServiceErrorKind, ServiceId, ServiceStatus,
};
use vigil_probe::{HealthProber, ProbeEvent, ProbeSet, ServiceRef};
use vigil_retry::RetryManager;
use vigil_runtime::{ContainerRuntime, ContainerSpec, ResourceLimits};
use vigil_store::{SnapshotKind, StateStore};

use crate::error::EngineError;
use crate::plan::{bind_strings, calculate_steps, managed_labels, Step};

/// Two liveness-driven restarts inside this window flip a service to
/// CrashLoopBackOff.
const CRASH_LOOP_WINDOW: chrono::Duration = chrono::Duration::minutes(10);

/// Stop grace period handed to the runtime, in seconds.
const STOP_GRACE_SECONDS: u32 = 10;

/// Outcome of one reconciliation cycle.
#[derive(Debug, Clone, Default)]
pub struct ReconcileSummary {
    pub planned: usize,
    pub errors: Vec<String>,
}

struct Graphs {
    target: DeviceGraph,
    current: DeviceGraph,
}

pub struct ContainerManager {
    store: Arc<dyn StateStore>,
    runtime: Arc<dyn ContainerRuntime>,
    retry: Arc<RetryManager>,
    prober: Arc<HealthProber>,
    graphs: Mutex<Graphs>,
    is_applying: AtomicBool,
    pending: AtomicBool,
    /// Liveness-driven restart timestamps per service, pruned to the window.
    restarts: std::sync::Mutex<HashMap<(AppId, ServiceId), Vec<DateTime<Utc>>>>,
}

impl ContainerManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        runtime: Arc<dyn ContainerRuntime>,
        retry: Arc<RetryManager>,
        prober: Arc<HealthProber>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runtime,
            retry,
            prober,
            graphs: Mutex::new(Graphs {
                target: DeviceGraph::default(),
                current: DeviceGraph::default(),
            }),
            is_applying: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            restarts: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Seed in-memory state from the persisted snapshots, so the first
    /// reconcile can detect divergence without re-enumerating the runtime.
    pub async fn load_persisted(&self) -> Result<(), EngineError> {
        let mut graphs = self.graphs.lock().await;
        if let Some(snap) = self.store.load_snapshot(SnapshotKind::Target).await? {
            graphs.target = serde_json::from_str(&snap.payload)
                .map_err(|e| EngineError::Internal(format!("corrupt target snapshot: {}", e)))?;
        }
        if let Some(snap) = self.store.load_snapshot(SnapshotKind::Current).await? {
            graphs.current = serde_json::from_str(&snap.payload)
                .map_err(|e| EngineError::Internal(format!("corrupt current snapshot: {}", e)))?;
        }
        Ok(())
    }

    /// Replace the target, persist it, and reconcile immediately so the
    /// first reaction to a cloud change is sub-second. Returns the summary,
    /// or `None` when the reconcile was coalesced into a running cycle.
    pub async fn set_target(
        self: &Arc<Self>,
        graph: DeviceGraph,
    ) -> Result<Option<ReconcileSummary>, EngineError> {
        self.store.save_snapshot(SnapshotKind::Target, &graph).await?;
        self.graphs.lock().await.target = graph;
        self.reconcile().await
    }

    pub async fn target_graph(&self) -> DeviceGraph {
        self.graphs.lock().await.target.clone()
    }

    pub async fn current_graph(&self) -> DeviceGraph {
        self.graphs.lock().await.current.clone()
    }

    pub fn get_health(&self) -> Vec<vigil_probe::ContainerHealth> {
        self.prober.get_health()
    }

    /// Run one reconciliation. Re-entry is forbidden: a call arriving while
    /// a cycle is applying is coalesced into at most one follow-up cycle.
    /// Returns `None` when the call was coalesced.
    pub async fn reconcile(self: &Arc<Self>) -> Result<Option<ReconcileSummary>, EngineError> {
        if self.is_applying.swap(true, Ordering::SeqCst) {
            self.pending.store(true, Ordering::SeqCst);
            return Ok(None);
        }

        let result = async {
            let mut summary = self.reconcile_cycle().await?;
            // A target change that arrived mid-cycle gets one more pass.
            while self.pending.swap(false, Ordering::SeqCst) {
                summary = self.reconcile_cycle().await?;
            }
            Ok(Some(summary))
        }
        .await;

        self.is_applying.store(false, Ordering::SeqCst);
        result
    }

    async fn reconcile_cycle(self: &Arc<Self>) -> Result<ReconcileSummary, EngineError> {
        let mut graphs = self.graphs.lock().await;
        let target = graphs.target.clone();
        let mut current = graphs.current.clone();

        // Images in active backoff are dropped from the plan along with the
        // starts that depend on them; they return once the deadline passes.
        let steps: Vec<Step> = calculate_steps(&target, &current)
            .into_iter()
            .filter(|step| {
                let image = match step {
                    Step::DownloadImage { image } => image.clone(),
                    Step::StartContainer { app_id, service_id } => {
                        match target.service(*app_id, *service_id) {
                            Some(svc) => svc.image_name.clone(),
                            None => return true,
                        }
                    }
                    _ => return true,
                };
                let backing_off = !self.retry.should_retry(&format!("image:{}", image));
                if backing_off {
                    debug!(image, "skipping step, image pull backing off");
                }
                !backing_off
            })
            .collect();
        let mut summary = ReconcileSummary { planned: steps.len(), errors: Vec::new() };
        if !steps.is_empty() {
            info!(steps = steps.len(), "reconciling");
        }

        for step in &steps {
            if let Err(message) = self.execute_step(step, &target, &mut current).await {
                debug!(step = %step, error = %message, "step failed");
                summary.errors.push(format!("{}: {}", step, message));
            }
        }

        prune_departed(&target, &mut current);
        current.config = target.config.clone();

        self.save_current_with_retry(&current).await?;
        graphs.current = current;

        if summary.errors.is_empty() {
            debug!(planned = summary.planned, "reconcile complete");
        } else {
            warn!(
                planned = summary.planned,
                failed = summary.errors.len(),
                "reconcile completed with failures"
            );
        }
        Ok(summary)
    }

    /// Execute one step. Failures are returned as messages, never
    /// propagated: one failed step must not prevent an unrelated step.
    async fn execute_step(
        self: &Arc<Self>,
        step: &Step,
        target: &DeviceGraph,
        current: &mut DeviceGraph,
    ) -> Result<(), String> {
        match step {
            Step::DownloadImage { image } => self.download_image(image, target, current).await,
            Step::CreateVolume { app_id, name } => self
                .runtime
                .create_volume(name, managed_labels(*app_id))
                .await
                .map_err(|e| e.to_string()),
            Step::CreateNetwork { name } => {
                // Network labels carry no app scope; networks are shared.
                let mut labels = HashMap::new();
                labels.insert(vigil_runtime::MANAGED_LABEL.to_string(), "true".to_string());
                self.runtime
                    .create_network(name, labels)
                    .await
                    .map_err(|e| e.to_string())
            }
            Step::StopContainer { app_id, service_id, container_id } => {
                self.prober.stop_monitoring(container_id);
                self.runtime
                    .stop_container(container_id, STOP_GRACE_SECONDS)
                    .await
                    .map_err(|e| e.to_string())?;
                if let Some(svc) = current.service_mut(*app_id, *service_id) {
                    svc.status = ServiceStatus::Stopped;
                }
                Ok(())
            }
            Step::RemoveContainer { app_id, service_id, container_id } => {
                self.runtime
                    .remove_container(container_id)
                    .await
                    .map_err(|e| e.to_string())?;
                if let Some(svc) = current.service_mut(*app_id, *service_id) {
                    svc.container_id = None;
                }
                Ok(())
            }
            Step::StartContainer { app_id, service_id } => {
                self.start_service(*app_id, *service_id, target, current).await
            }
            Step::RemoveNetwork { name } => {
                self.runtime.remove_network(name).await.map_err(|e| e.to_string())
            }
            Step::RemoveVolume { name } => {
                self.runtime.remove_volume(name).await.map_err(|e| e.to_string())
            }
        }
    }

    async fn download_image(
        self: &Arc<Self>,
        image: &str,
        target: &DeviceGraph,
        current: &mut DeviceGraph,
    ) -> Result<(), String> {
        let key = format!("image:{}", image);
        if !self.retry.should_retry(&key) {
            debug!(image, "image pull backing off");
            return Ok(());
        }
        match self.runtime.pull_image(image).await {
            Ok(()) => {
                self.retry.record_success(&key);
                Ok(())
            }
            Err(e) => {
                let entry = self.retry.record_failure(&key, e.to_string());
                // Every target service on this image carries the error.
                for (app_id, svc) in target.services() {
                    if svc.image_name == image {
                        mark_service_error(
                            current,
                            target,
                            app_id,
                            svc.service_id,
                            ServiceErrorKind::ImagePullBackOff,
                            &e.to_string(),
                            entry.attempt,
                            Some(entry.next_attempt_at),
                        );
                    }
                }
                Err(e.to_string())
            }
        }
    }

    async fn start_service(
        self: &Arc<Self>,
        app_id: AppId,
        service_id: ServiceId,
        target: &DeviceGraph,
        current: &mut DeviceGraph,
    ) -> Result<(), String> {
        let Some(service) = target.service(app_id, service_id) else {
            return Err(format!("service {}:{} left the target mid-cycle", app_id, service_id));
        };

        // An image still in pull backoff makes this start a no-op.
        let image_key = format!("image:{}", service.image_name);
        match self.runtime.image_present(&service.image_name).await {
            Ok(true) => {}
            Ok(false) => {
                if self.retry.entry(&image_key).is_none() {
                    // No pull has failed yet; transient gap before backoff.
                    mark_service_error(
                        current,
                        target,
                        app_id,
                        service_id,
                        ServiceErrorKind::ErrImagePull,
                        "image not present in runtime",
                        0,
                        None,
                    );
                }
                debug!(service = %service.service_name, "image absent, start skipped");
                return Ok(());
            }
            Err(e) => return Err(e.to_string()),
        }

        let service_key = format!("service:{}:{}", app_id, service_id);
        if !self.retry.should_retry(&service_key) {
            debug!(service = %service.service_name, "start backing off");
            return Ok(());
        }

        match self.run_container(app_id, service).await {
            Ok(container_id) => {
                self.retry.record_success(&service_key);
                upsert_running(current, target, app_id, service, &container_id);
                self.begin_monitoring(&container_id, app_id, service);
                info!(service = %service.service_name, container_id = %container_id, "service started");
                Ok(())
            }
            Err(e) => {
                let entry = self.retry.record_failure(&service_key, e.to_string());
                let kind = if self.in_crash_loop(app_id, service_id) {
                    ServiceErrorKind::CrashLoopBackOff
                } else {
                    ServiceErrorKind::StartFailure
                };
                mark_service_error(
                    current,
                    target,
                    app_id,
                    service_id,
                    kind,
                    &e.to_string(),
                    entry.attempt,
                    Some(entry.next_attempt_at),
                );
                Err(e.to_string())
            }
        }
    }

    async fn run_container(
        &self,
        app_id: AppId,
        service: &Service,
    ) -> Result<String, vigil_runtime::RuntimeError> {
        let spec = container_spec(app_id, service);
        let container_id = self.runtime.create_container(&spec).await?;
        if let Err(e) = self.runtime.start_container(&container_id).await {
            // Don't leave a created-but-dead container behind.
            let _ = self.runtime.remove_container(&container_id).await;
            return Err(e);
        }
        Ok(container_id)
    }

    fn begin_monitoring(self: &Arc<Self>, container_id: &str, app_id: AppId, service: &Service) {
        let probes = ProbeSet {
            startup: service.config.startup_probe.clone(),
            liveness: service.config.liveness_probe.clone(),
            readiness: service.config.readiness_probe.clone(),
        };
        if probes.is_empty() {
            return;
        }
        self.prober.start_monitoring(
            container_id,
            ServiceRef { app_id, service_id: service.service_id },
            probes,
        );
    }

    fn in_crash_loop(&self, app_id: AppId, service_id: ServiceId) -> bool {
        let restarts = self.restarts.lock().unwrap();
        restarts
            .get(&(app_id, service_id))
            .map(|ts| ts.len() > 1)
            .unwrap_or(false)
    }

    fn note_restart(&self, app_id: AppId, service_id: ServiceId, now: DateTime<Utc>) -> usize {
        let mut restarts = self.restarts.lock().unwrap();
        let entry = restarts.entry((app_id, service_id)).or_default();
        entry.retain(|t| now - *t < CRASH_LOOP_WINDOW);
        entry.push(now);
        entry.len()
    }

    /// Consume prober events. Late events for containers that are no longer
    /// current are discarded here, closing the race around stop_monitoring.
    pub async fn run_probe_events(
        self: Arc<Self>,
        mut events: tokio::sync::mpsc::Receiver<ProbeEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => match event {
                    Some(e) => e,
                    None => return,
                },
            };
            match event {
                ProbeEvent::LivenessFailed { container_id, service } => {
                    if let Err(e) = self.restart_service(&container_id, service).await {
                        warn!(%service, error = %e, "liveness restart failed");
                    }
                }
                ProbeEvent::ReadinessChanged { container_id, service, ready } => {
                    debug!(%service, container_id, ready, "readiness changed");
                }
                ProbeEvent::StartupCompleted { container_id, service } => {
                    debug!(%service, container_id, "startup completed");
                }
            }
        }
    }

    /// Liveness failure handling: verify the container is still current,
    /// replace it, and flag a crash loop when restarts pile up.
    pub async fn restart_service(
        self: &Arc<Self>,
        container_id: &str,
        service: ServiceRef,
    ) -> Result<(), EngineError> {
        let ServiceRef { app_id, service_id } = service;
        let mut graphs = self.graphs.lock().await;

        // Discard rule: ignore events for containers we no longer own.
        let still_current = graphs
            .current
            .service(app_id, service_id)
            .and_then(|s| s.container_id.as_deref())
            == Some(container_id);
        if !still_current {
            debug!(%service, container_id, "discarding late probe event");
            return Ok(());
        }
        let Some(target_service) = graphs.target.service(app_id, service_id).cloned() else {
            return Ok(());
        };

        let restart_count = self.note_restart(app_id, service_id, Utc::now());
        info!(%service, container_id, restart_count, "restarting unhealthy container");

        self.prober.stop_monitoring(container_id);
        if let Err(e) = self.runtime.stop_container(container_id, STOP_GRACE_SECONDS).await {
            debug!(container_id, error = %e, "stop before restart failed");
        }
        self.runtime.remove_container(container_id).await?;

        let target = graphs.target.clone();
        match self.run_container(app_id, &target_service).await {
            Ok(new_id) => {
                upsert_running(&mut graphs.current, &target, app_id, &target_service, &new_id);
                self.begin_monitoring(&new_id, app_id, &target_service);
                if restart_count > 1 {
                    mark_service_error(
                        &mut graphs.current,
                        &target,
                        app_id,
                        service_id,
                        ServiceErrorKind::CrashLoopBackOff,
                        "container restarted repeatedly after liveness failures",
                        restart_count as u32,
                        None,
                    );
                    // The replacement is running; keep its id visible.
                    if let Some(svc) = graphs.current.service_mut(app_id, service_id) {
                        svc.container_id = Some(new_id);
                    }
                }
            }
            Err(e) => {
                let key = format!("service:{}:{}", app_id, service_id);
                let entry = self.retry.record_failure(&key, e.to_string());
                mark_service_error(
                    &mut graphs.current,
                    &target,
                    app_id,
                    service_id,
                    ServiceErrorKind::CrashLoopBackOff,
                    &e.to_string(),
                    entry.attempt,
                    Some(entry.next_attempt_at),
                );
            }
        }

        let current = graphs.current.clone();
        self.save_current_with_retry(&current).await?;
        Ok(())
    }

    /// Persistence failures get a few short-backoff retries; a store that
    /// stays unwritable is a data-integrity risk and propagates as fatal.
    async fn save_current_with_retry(&self, current: &DeviceGraph) -> Result<(), EngineError> {
        let mut attempt = 0u32;
        loop {
            match self.store.save_snapshot(SnapshotKind::Current, current).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < 2 => {
                    attempt += 1;
                    warn!(error = %e, attempt, "current snapshot write failed, retrying");
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Periodic safety net: reconcile every `interval` until cancelled.
    /// Ticks are skipped while an apply is already in flight.
    pub fn start_auto_reconcile(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick consumed
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if manager.is_applying.load(Ordering::SeqCst) {
                    continue;
                }
                if let Err(e) = manager.reconcile().await {
                    warn!(error = %e, "auto-reconcile failed");
                }
            }
        })
    }
}

/// Build the runtime creation request for a service.
fn container_spec(app_id: AppId, service: &Service) -> ContainerSpec {
    let mut labels = managed_labels(app_id);
    labels.insert("service-id".to_string(), service.service_id.to_string());

    let mut env: Vec<String> = service
        .config
        .environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    env.sort();

    let resources = service.config.resources.as_ref().map(|r| ResourceLimits {
        cpu_millicores: r.limits.cpu_millicores().ok().flatten(),
        memory_bytes: r.limits.memory_bytes().ok().flatten(),
    });

    ContainerSpec {
        name: format!("{}_{}", app_id, service.service_name),
        image: service.image_name.clone(),
        ports: service
            .config
            .ports
            .iter()
            .map(|p| (p.host, p.container, p.protocol.clone()))
            .collect(),
        env,
        binds: bind_strings(app_id, service),
        networks: service.config.networks.clone(),
        labels,
        resources,
        restart_policy: None, // the agent supervises restarts itself
    }
}

/// Write a running service into the current graph, clearing any error.
fn upsert_running(
    current: &mut DeviceGraph,
    target: &DeviceGraph,
    app_id: AppId,
    service: &Service,
    container_id: &str,
) {
    let app = current.apps.entry(app_id).or_insert_with(|| App {
        app_id,
        app_name: target
            .apps
            .get(&app_id)
            .map(|a| a.app_name.clone())
            .unwrap_or_default(),
        services: Vec::new(),
    });
    let mut updated = service.clone();
    updated.container_id = Some(container_id.to_string());
    updated.status = ServiceStatus::Running;
    updated.error = None;
    match app.services.iter_mut().find(|s| s.service_id == service.service_id) {
        Some(existing) => *existing = updated,
        None => app.services.push(updated),
    }
}

/// Record a failure on a service in the current graph, creating the entry
/// if the service never got as far as running.
#[allow(clippy::too_many_arguments)]
fn mark_service_error(
    current: &mut DeviceGraph,
    target: &DeviceGraph,
    app_id: AppId,
    service_id: ServiceId,
    kind: ServiceErrorKind,
    message: &str,
    retry_count: u32,
    next_retry_at: Option<DateTime<Utc>>,
) {
    let app = current.apps.entry(app_id).or_insert_with(|| App {
        app_id,
        app_name: target
            .apps
            .get(&app_id)
            .map(|a| a.app_name.clone())
            .unwrap_or_default(),
        services: Vec::new(),
    });

    let svc = match app.services.iter_mut().find(|s| s.service_id == service_id) {
        Some(s) => s,
        None => {
            let Some(template) = target.service(app_id, service_id) else { return };
            app.services.push(template.clone());
            app.services.last_mut().unwrap()
        }
    };

    let first_observed_at = svc
        .error
        .as_ref()
        .filter(|e| e.kind == kind)
        .map(|e| e.first_observed_at)
        .unwrap_or_else(Utc::now);
    svc.status = ServiceStatus::Error;
    svc.error = Some(ServiceError {
        kind,
        message: message.to_string(),
        first_observed_at,
        retry_count,
        next_retry_at,
    });
}

/// Drop current-graph services that left the target and no longer hold a
/// container, then drop empty apps.
fn prune_departed(target: &DeviceGraph, current: &mut DeviceGraph) {
    for (app_id, app) in current.apps.iter_mut() {
        app.services.retain(|svc| {
            target.service(*app_id, svc.service_id).is_some() || svc.container_id.is_some()
        });
    }
    current.apps.retain(|_, app| !app.services.is_empty());
}
