use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vigil_domain::{AppId, Probe, ProbeHandler, ServiceId};
use vigil_runtime::ContainerRuntime;

use crate::check::run_check;
use crate::state::{ContainerHealth, ProbeKind, ProbeState, ProbeStatus};

/// Identity of the service a monitored container belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    pub app_id: AppId,
    pub service_id: ServiceId,
}

impl std::fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.app_id, self.service_id)
    }
}

/// Status-change events emitted by the prober. Consumers must tolerate late
/// events for containers they already stopped monitoring.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeEvent {
    LivenessFailed { container_id: String, service: ServiceRef },
    ReadinessChanged { container_id: String, service: ServiceRef, ready: bool },
    StartupCompleted { container_id: String, service: ServiceRef },
}

/// The probes configured for one container.
#[derive(Debug, Clone, Default)]
pub struct ProbeSet {
    pub startup: Option<Probe>,
    pub liveness: Option<Probe>,
    pub readiness: Option<Probe>,
}

impl ProbeSet {
    pub fn is_empty(&self) -> bool {
        self.startup.is_none() && self.liveness.is_none() && self.readiness.is_none()
    }
}

struct Monitor {
    service: ServiceRef,
    state: Arc<Mutex<HashMap<ProbeKind, ProbeState>>>,
    cancel: CancellationToken,
}

/// Runs per-container probe loops and emits status-change events.
///
/// Each probe kind gets its own timer task, so a slow check on one container
/// never delays another. Liveness and readiness are held until a configured
/// startup probe reports healthy.
pub struct HealthProber {
    runtime: Arc<dyn ContainerRuntime>,
    http: reqwest::Client,
    events: mpsc::Sender<ProbeEvent>,
    monitors: Mutex<HashMap<String, Monitor>>,
}

impl HealthProber {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, events: mpsc::Sender<ProbeEvent>) -> Self {
        Self {
            runtime,
            http: reqwest::Client::new(),
            events,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Begin probing `container_id`. A second call for the same container
    /// replaces the previous monitor.
    pub fn start_monitoring(
        self: &Arc<Self>,
        container_id: &str,
        service: ServiceRef,
        probes: ProbeSet,
    ) {
        if probes.is_empty() {
            return;
        }
        self.stop_monitoring(container_id);

        let cancel = CancellationToken::new();
        let state = Arc::new(Mutex::new(HashMap::new()));
        // Gate opens immediately when no startup probe is configured.
        let (gate_tx, gate_rx) = watch::channel(probes.startup.is_none());

        if let Some(startup) = probes.startup.clone() {
            self.spawn_probe_loop(
                container_id,
                service,
                ProbeKind::Startup,
                startup,
                state.clone(),
                cancel.clone(),
                None,
                Some(gate_tx),
            );
        }
        if let Some(mut liveness) = probes.liveness.clone() {
            if liveness.success_threshold > 1 {
                warn!(
                    %service,
                    success_threshold = liveness.success_threshold,
                    "liveness success_threshold clamped to 1"
                );
                liveness.success_threshold = 1;
            }
            self.spawn_probe_loop(
                container_id,
                service,
                ProbeKind::Liveness,
                liveness,
                state.clone(),
                cancel.clone(),
                Some(gate_rx.clone()),
                None,
            );
        }
        if let Some(readiness) = probes.readiness.clone() {
            self.spawn_probe_loop(
                container_id,
                service,
                ProbeKind::Readiness,
                readiness,
                state.clone(),
                cancel.clone(),
                Some(gate_rx),
                None,
            );
        }

        self.monitors
            .lock()
            .unwrap()
            .insert(container_id.to_string(), Monitor { service, state, cancel });
    }

    /// Stop probing `container_id` and drop its state. Events already in the
    /// channel may still be delivered afterwards.
    pub fn stop_monitoring(&self, container_id: &str) {
        if let Some(monitor) = self.monitors.lock().unwrap().remove(container_id) {
            monitor.cancel.cancel();
            debug!(container_id, "stopped monitoring");
        }
    }

    pub fn is_monitoring(&self, container_id: &str) -> bool {
        self.monitors.lock().unwrap().contains_key(container_id)
    }

    /// Snapshot of probe state for every monitored container.
    pub fn get_health(&self) -> Vec<ContainerHealth> {
        self.monitors
            .lock()
            .unwrap()
            .iter()
            .map(|(container_id, m)| ContainerHealth {
                container_id: container_id.clone(),
                app_id: m.service.app_id,
                service_id: m.service.service_id,
                probes: m.state.lock().unwrap().clone(),
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_probe_loop(
        self: &Arc<Self>,
        container_id: &str,
        service: ServiceRef,
        kind: ProbeKind,
        probe: Probe,
        state: Arc<Mutex<HashMap<ProbeKind, ProbeState>>>,
        cancel: CancellationToken,
        mut gate: Option<watch::Receiver<bool>>,
        gate_tx: Option<watch::Sender<bool>>,
    ) {
        let prober = self.clone();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            // Held until startup completes.
            if let Some(rx) = gate.as_mut() {
                let wait = rx.wait_for(|ready| *ready);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = wait => {
                        if result.is_err() {
                            return;
                        }
                    }
                }
            }

            let initial = Duration::from_secs(probe.initial_delay_seconds);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(initial) => {}
            }

            let period = Duration::from_secs(probe.period_seconds.max(1));
            let deadline = Duration::from_secs(probe.timeout_seconds.max(1));
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                let outcome = prober
                    .check_container(&container_id, &probe.handler, deadline)
                    .await;
                let transition = {
                    let mut map = state.lock().unwrap();
                    map.entry(kind).or_default().observe(
                        outcome.success,
                        probe.success_threshold,
                        probe.failure_threshold,
                        chrono::Utc::now(),
                        Some(outcome.message.clone()),
                    )
                };

                let Some(new_status) = transition else { continue };
                debug!(container_id = %container_id, %kind, ?new_status, "probe transition");

                match (kind, new_status) {
                    (ProbeKind::Startup, ProbeStatus::Healthy) => {
                        if let Some(tx) = &gate_tx {
                            let _ = tx.send(true);
                        }
                        let _ = prober
                            .events
                            .send(ProbeEvent::StartupCompleted {
                                container_id: container_id.clone(),
                                service,
                            })
                            .await;
                        // Startup probes run only until first success.
                        return;
                    }
                    (ProbeKind::Liveness, ProbeStatus::Unhealthy) => {
                        let _ = prober
                            .events
                            .send(ProbeEvent::LivenessFailed {
                                container_id: container_id.clone(),
                                service,
                            })
                            .await;
                    }
                    (ProbeKind::Readiness, status) => {
                        let _ = prober
                            .events
                            .send(ProbeEvent::ReadinessChanged {
                                container_id: container_id.clone(),
                                service,
                                ready: status == ProbeStatus::Healthy,
                            })
                            .await;
                    }
                    _ => {}
                }
            }
        });
    }

    async fn check_container(
        &self,
        container_id: &str,
        handler: &ProbeHandler,
        deadline: Duration,
    ) -> crate::check::CheckOutcome {
        // Resolve the ip at check time; containers get addresses after start.
        let ip = match handler {
            ProbeHandler::Exec { .. } => None,
            _ => self
                .runtime
                .inspect_container(container_id)
                .await
                .ok()
                .and_then(|c| c.ip_address),
        };
        run_check(
            &self.http,
            &self.runtime,
            container_id,
            ip.as_deref(),
            handler,
            deadline,
        )
        .await
    }

    /// Cancel every monitor. Called on shutdown.
    pub fn shutdown(&self) {
        let mut monitors = self.monitors.lock().unwrap();
        for (_, monitor) in monitors.drain() {
            monitor.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_runtime::{ContainerSpec, MockRuntime};

    fn service_ref() -> ServiceRef {
        ServiceRef { app_id: AppId(1), service_id: ServiceId(1) }
    }

    async fn container_on(rt: &MockRuntime) -> String {
        rt.pull_image("busybox").await.unwrap();
        let id = rt
            .create_container(&ContainerSpec {
                name: "probed".into(),
                image: "busybox".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        rt.start_container(&id).await.unwrap();
        id
    }

    fn fast_exec_probe(failure_threshold: u32) -> Probe {
        let mut p = Probe::exec(vec!["health".into()]);
        p.period_seconds = 1;
        p.failure_threshold = failure_threshold;
        p
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_failure_emits_event_at_threshold() {
        let rt = MockRuntime::new();
        let id = container_on(&rt).await;
        rt.set_exec_exit_code(&id, 1);

        let (tx, mut rx) = mpsc::channel(16);
        let prober = Arc::new(HealthProber::new(Arc::new(rt), tx));
        prober.start_monitoring(
            &id,
            service_ref(),
            ProbeSet { liveness: Some(fast_exec_probe(3)), ..Default::default() },
        );

        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("expected an event")
            .unwrap();
        assert_eq!(
            event,
            ProbeEvent::LivenessFailed { container_id: id, service: service_ref() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn startup_gates_liveness() {
        let rt = MockRuntime::new();
        let id = container_on(&rt).await;
        // Exec succeeds, so startup completes on its first tick.
        let (tx, mut rx) = mpsc::channel(16);
        let prober = Arc::new(HealthProber::new(Arc::new(rt.clone()), tx));
        prober.start_monitoring(
            &id,
            service_ref(),
            ProbeSet {
                startup: Some(fast_exec_probe(3)),
                liveness: Some(fast_exec_probe(3)),
                ..Default::default()
            },
        );

        let first = tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .expect("expected startup event")
            .unwrap();
        assert_eq!(
            first,
            ProbeEvent::StartupCompleted { container_id: id.clone(), service: service_ref() }
        );

        // After startup, liveness runs and stays healthy. Break it and the
        // failure event arrives.
        rt.set_exec_exit_code(&id, 1);
        let next = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("expected liveness event")
            .unwrap();
        assert_eq!(
            next,
            ProbeEvent::LivenessFailed { container_id: id, service: service_ref() }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_transitions_both_ways() {
        let rt = MockRuntime::new();
        let id = container_on(&rt).await;

        let (tx, mut rx) = mpsc::channel(16);
        let prober = Arc::new(HealthProber::new(Arc::new(rt.clone()), tx));
        let mut probe = fast_exec_probe(2);
        probe.success_threshold = 1;
        prober.start_monitoring(
            &id,
            service_ref(),
            ProbeSet { readiness: Some(probe), ..Default::default() },
        );

        let up = rx.recv().await.unwrap();
        assert!(matches!(up, ProbeEvent::ReadinessChanged { ready: true, .. }));

        rt.set_exec_exit_code(&id, 1);
        let down = tokio::time::timeout(Duration::from_secs(60), rx.recv())
            .await
            .expect("expected not-ready event")
            .unwrap();
        assert!(matches!(down, ProbeEvent::ReadinessChanged { ready: false, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_monitoring_halts_events() {
        let rt = MockRuntime::new();
        let id = container_on(&rt).await;
        rt.set_exec_exit_code(&id, 1);

        let (tx, mut rx) = mpsc::channel(16);
        let prober = Arc::new(HealthProber::new(Arc::new(rt), tx));
        prober.start_monitoring(
            &id,
            service_ref(),
            ProbeSet { liveness: Some(fast_exec_probe(1)), ..Default::default() },
        );

        // First failure event arrives, then we stop.
        let _ = rx.recv().await.unwrap();
        prober.stop_monitoring(&id);
        assert!(!prober.is_monitoring(&id));
        assert!(prober.get_health().is_empty());

        // Drain anything already in flight, then confirm silence.
        tokio::time::sleep(Duration::from_secs(5)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn get_health_reports_probe_state() {
        let rt = MockRuntime::new();
        let id = container_on(&rt).await;

        let (tx, mut rx) = mpsc::channel(16);
        let prober = Arc::new(HealthProber::new(Arc::new(rt), tx));
        let mut probe = fast_exec_probe(3);
        probe.success_threshold = 1;
        prober.start_monitoring(
            &id,
            service_ref(),
            ProbeSet { readiness: Some(probe), ..Default::default() },
        );
        let _ = rx.recv().await; // first ready event

        let health = prober.get_health();
        assert_eq!(health.len(), 1);
        let state = health[0].probes.get(&ProbeKind::Readiness).unwrap();
        assert_eq!(state.status, ProbeStatus::Healthy);
        assert!(state.consecutive_successes >= 1);
    }
}
