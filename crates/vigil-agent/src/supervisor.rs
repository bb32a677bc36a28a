//! Process lifecycle: boot order, signal handling, and reverse-order
//! graceful shutdown with a bounded grace window per stage.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vigil_cloud::{
    ensure_identity, provision, run_job_poller, run_report_loop, run_target_poll,
    start_log_shipper, CloudApi, LogRecord, RejectAllHandler,
};
use vigil_engine::ContainerManager;
use vigil_mqtt::{jobs_filter, rotation_topic, MqttBus, MqttSettings, RotationNotice};
use vigil_probe::HealthProber;
use vigil_retry::{RetryManager, RetryPolicy};
use vigil_runtime::{ContainerRuntime, DockerRuntime};
use vigil_sensors::{AdapterManager, VirtualAdapterFactory};
use vigil_store::{RedbStore, StateStore};

use crate::settings::Settings;
use crate::wiring::{MqttSensorPublisher, NullSensorPublisher, ReportBundle, TargetFanout};

/// Grace window for each shutdown stage.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Interval between provisioning attempts while the cloud is unreachable.
const PROVISION_RETRY: Duration = Duration::from_secs(30);

/// How often the device asks whether its key needs rotation.
const KEY_STATUS_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

struct Stage {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

async fn stop_stage(stage: Stage) {
    stage.cancel.cancel();
    if tokio::time::timeout(SHUTDOWN_GRACE, stage.handle).await.is_err() {
        warn!(stage = stage.name, "stage did not stop within grace window, aborting");
    }
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    // ── Boot: store, identity, runtime ───────────────────────────────────────

    let db_path = settings.data_dir.join("state.redb");
    let store: Arc<dyn StateStore> =
        Arc::new(RedbStore::open(&db_path).context("opening state store")?);
    let identity = ensure_identity(&store, settings.fleet_key.clone())
        .await
        .context("loading device identity")?;
    info!(uuid = %identity.uuid, provisioned = identity.provisioned, "identity loaded");

    let docker =
        DockerRuntime::connect(&settings.docker_socket).context("connecting container runtime")?;
    docker.ping().await.context("container runtime unreachable")?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    let root = CancellationToken::new();
    spawn_signal_handler(root.clone());

    // ── Core managers ────────────────────────────────────────────────────────

    let retry = Arc::new(RetryManager::new(RetryPolicy::default()));
    let (probe_tx, probe_rx) = mpsc::channel(256);
    let prober = Arc::new(HealthProber::new(runtime.clone(), probe_tx));
    let engine = ContainerManager::new(store.clone(), runtime.clone(), retry.clone(), prober.clone());
    engine.load_persisted().await.context("loading persisted state")?;

    let probe_events = {
        let cancel = root.child_token();
        Stage {
            name: "probe-events",
            cancel: cancel.clone(),
            handle: tokio::spawn(engine.clone().run_probe_events(probe_rx, cancel)),
        }
    };

    // ── MQTT bus ─────────────────────────────────────────────────────────────

    let mut mqtt_stage = None;
    let bus = match settings.mqtt_host_port() {
        Some((host, port)) => {
            let cancel = root.child_token();
            let (bus, handle) = MqttBus::connect(
                MqttSettings::new(host, port, identity.uuid.clone()),
                cancel.clone(),
            );
            mqtt_stage = Some(Stage { name: "mqtt", cancel, handle });
            Some(Arc::new(bus))
        }
        None => None,
    };

    // ── Sensors ──────────────────────────────────────────────────────────────

    let mut adapter_manager = match &bus {
        Some(bus) => AdapterManager::new(
            Arc::new(MqttSensorPublisher {
                bus: bus.clone(),
                base_topic: settings.mqtt_base_topic.clone(),
            }),
            retry.clone(),
        ),
        None => AdapterManager::new(Arc::new(NullSensorPublisher), retry.clone()),
    };
    adapter_manager.register(Arc::new(VirtualAdapterFactory::new()));
    let sensors = Arc::new(adapter_manager);

    // Resume from the persisted target before the first poll answers.
    let boot_target = engine.target_graph().await;
    let features = boot_target.config.features.clone();
    if features.protocol_adapters {
        sensors.reconcile(boot_target.sensors.clone());
    }
    if let Err(e) = engine.reconcile().await {
        warn!(error = %e, "boot reconcile failed");
    }

    // ── Cloud loops ──────────────────────────────────────────────────────────

    let mut cloud_stages: Vec<Stage> = Vec::new();
    let mut log_stage = None;

    if let Some(url) = settings.cloud_url.clone() {
        let api = Arc::new(CloudApi::new(url, identity.active_key()));

        // Provision before the loops start; retry until the cloud answers
        // or shutdown is requested.
        loop {
            if root.is_cancelled() {
                break;
            }
            match provision(&store, &api, settings.device_name.as_deref()).await {
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "provisioning failed, retrying");
                    tokio::select! {
                        _ = root.cancelled() => break,
                        _ = tokio::time::sleep(PROVISION_RETRY) => {}
                    }
                }
            }
        }

        let config = engine.target_graph().await.config;
        let poll_interval = Duration::from_millis(
            settings.poll_interval_ms.unwrap_or(config.poll_interval_ms),
        );
        let report_interval = Duration::from_millis(
            settings.report_interval_ms.unwrap_or(config.report_interval_ms),
        );

        let fanout = Arc::new(TargetFanout { engine: engine.clone(), sensors: sensors.clone() });
        {
            let cancel = root.child_token();
            cloud_stages.push(Stage {
                name: "target-poll",
                cancel: cancel.clone(),
                handle: tokio::spawn(run_target_poll(
                    api.clone(),
                    store.clone(),
                    identity.uuid.clone(),
                    poll_interval,
                    fanout,
                    cancel,
                )),
            });
        }

        let report_source = Arc::new(ReportBundle {
            uuid: identity.uuid.clone(),
            engine: engine.clone(),
            sensors: sensors.clone(),
        });
        {
            let cancel = root.child_token();
            cloud_stages.push(Stage {
                name: "report",
                cancel: cancel.clone(),
                handle: tokio::spawn(run_report_loop(
                    api.clone(),
                    store.clone(),
                    report_interval,
                    report_source,
                    cancel,
                )),
            });
        }

        if features.jobs {
            let cancel = root.child_token();
            cloud_stages.push(Stage {
                name: "job-poll",
                cancel: cancel.clone(),
                handle: tokio::spawn(run_job_poller(
                    api.clone(),
                    identity.uuid.clone(),
                    Duration::from_millis(settings.job_poll_interval_ms),
                    Arc::new(RejectAllHandler),
                    cancel,
                )),
            });
        }

        {
            let cancel = root.child_token();
            let (shipper, handle) = start_log_shipper(
                api.clone(),
                identity.uuid.clone(),
                Duration::from_millis(settings.log_flush_interval_ms),
                settings.log_max_batch,
                cancel.clone(),
            );
            shipper.push(LogRecord {
                at: chrono::Utc::now(),
                app_id: None,
                service: None,
                level: "info".into(),
                message: "agent started".into(),
            });
            log_stage = Some((shipper, Stage { name: "log-shipper", cancel, handle }));
        }

        // Client-initiated rotation: check key TTL periodically and rotate
        // before expiry.
        {
            let cancel = root.child_token();
            let api = api.clone();
            let store = store.clone();
            let uuid = identity.uuid.clone();
            cloud_stages.push(Stage {
                name: "key-status",
                cancel: cancel.clone(),
                handle: tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(KEY_STATUS_INTERVAL);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = ticker.tick() => {}
                        }
                        match api.key_status(&uuid).await {
                            Ok(status) if status.needs_rotation => {
                                info!(days = ?status.days_until_expiry, "rotating device key");
                                match api.rotate_key(&uuid, "ttl-expiry").await {
                                    Ok(grant) => {
                                        if let Err(e) = vigil_cloud::apply_rotation(
                                            &store,
                                            &api,
                                            grant.new_key,
                                        )
                                        .await
                                        {
                                            warn!(error = %e, "applying rotation grant failed");
                                        }
                                    }
                                    Err(e) => warn!(error = %e, "key rotation request failed"),
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "key status check failed"),
                        }
                    }
                }),
            });
        }

        // Rotation notices and the optional MQTT job channel.
        if let Some(bus) = &bus {
            if let Ok(mut rx) = bus.subscribe(&rotation_topic(&identity.uuid)).await {
                let cancel = root.child_token();
                let store = store.clone();
                let api = api.clone();
                cloud_stages.push(Stage {
                    name: "rotation",
                    cancel: cancel.clone(),
                    handle: tokio::spawn(async move {
                        loop {
                            let message = tokio::select! {
                                _ = cancel.cancelled() => return,
                                m = rx.recv() => match m { Some(m) => m, None => return },
                            };
                            match RotationNotice::parse(&message.payload) {
                                Ok(notice) => {
                                    if let Err(e) =
                                        vigil_cloud::apply_rotation(&store, &api, notice.new_api_key)
                                            .await
                                    {
                                        warn!(error = %e, "key rotation failed");
                                    }
                                }
                                Err(e) => warn!(error = %e, "bad rotation payload"),
                            }
                        }
                    }),
                });
            }

            if features.jobs {
                if let Ok(mut rx) = bus.subscribe(&jobs_filter(&identity.uuid)).await {
                    let cancel = root.child_token();
                    let api = api.clone();
                    let uuid = identity.uuid.clone();
                    cloud_stages.push(Stage {
                        name: "jobs-mqtt",
                        cancel: cancel.clone(),
                        handle: tokio::spawn(async move {
                            let handler = RejectAllHandler;
                            loop {
                                let message = tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    m = rx.recv() => match m { Some(m) => m, None => return },
                                };
                                let Ok(job) =
                                    serde_json::from_slice::<vigil_cloud::Job>(&message.payload)
                                else {
                                    warn!(topic = %message.topic, "bad job payload");
                                    continue;
                                };
                                use vigil_cloud::JobHandler;
                                let outcome = handler.handle(&job).await;
                                if let Err(e) = api.ack_job(&uuid, &job.id, &outcome).await {
                                    warn!(job_id = %job.id, error = %e, "job ack failed");
                                }
                            }
                        }),
                    });
                }
            }
        }
    }

    // ── Auto-reconcile safety net ────────────────────────────────────────────

    let reconcile_interval = Duration::from_millis(
        settings
            .reconcile_interval_ms
            .unwrap_or(engine.target_graph().await.config.reconcile_interval_ms),
    );
    let auto_reconcile = {
        let cancel = root.child_token();
        Stage {
            name: "auto-reconcile",
            cancel: cancel.clone(),
            handle: engine.start_auto_reconcile(reconcile_interval, cancel),
        }
    };

    info!("vigil agent running");
    root.cancelled().await;
    info!("shutdown requested");

    // ── Shutdown, reverse of startup ─────────────────────────────────────────
    // adapters & probes → drain logs → mqtt → cloud loops → auto-reconcile →
    // store and runtime drop last.

    sensors.shutdown();
    prober.shutdown();

    if let Some((shipper, stage)) = log_stage {
        shipper.push(LogRecord {
            at: chrono::Utc::now(),
            app_id: None,
            service: None,
            level: "info".into(),
            message: "agent stopping".into(),
        });
        stop_stage(stage).await;
    }

    // Bus consumers (rotation, mqtt jobs) stop with the cloud loops, so the
    // shared connection disconnects only after all of them.
    for stage in cloud_stages.into_iter().rev() {
        stop_stage(stage).await;
    }
    if let Some(stage) = mqtt_stage {
        stop_stage(stage).await;
    }
    stop_stage(auto_reconcile).await;
    stop_stage(probe_events).await;

    info!("vigil agent stopped");
    Ok(())
}

fn spawn_signal_handler(root: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    let _ = ctrl_c.await;
                    root.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = term.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received ctrl-c");
        }
        root.cancel();
    });
}
