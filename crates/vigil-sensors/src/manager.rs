//! Reconciles declarative sensor configuration against the registry of
//! running adapter loops. Diffing is by device name with a canonical config
//! hash deciding whether a running adapter must be restarted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_domain::{DeploymentStatus, SensorDevice, SensorProtocol};
use vigil_retry::RetryManager;
use vigil_store::state_hash;

use crate::adapter::{AdapterFactory, AdapterHealth, SensorPublisher, SensorReading};
use crate::error::SensorError;

struct RunningAdapter {
    config_hash: String,
    enabled: bool,
    cancel: CancellationToken,
    health: Arc<Mutex<AdapterHealth>>,
    device: Arc<Mutex<SensorDevice>>,
}

pub struct AdapterManager {
    factories: HashMap<SensorProtocol, Arc<dyn AdapterFactory>>,
    publisher: Arc<dyn SensorPublisher>,
    retry: Arc<RetryManager>,
    running: Mutex<HashMap<String, RunningAdapter>>,
}

/// Hash over the fields that define an adapter's behavior. Status fields
/// are excluded so reporting churn never restarts an adapter.
fn config_hash(device: &SensorDevice) -> String {
    state_hash(&json!({
        "protocol": device.protocol,
        "connection": device.connection,
        "data_points": device.data_points,
        "poll_interval_ms": device.poll_interval_ms,
        "metadata": device.metadata,
    }))
}

impl AdapterManager {
    pub fn new(publisher: Arc<dyn SensorPublisher>, retry: Arc<RetryManager>) -> Self {
        Self {
            factories: HashMap::new(),
            publisher,
            retry,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn AdapterFactory>) {
        self.factories.insert(factory.protocol(), factory);
    }

    /// Apply a declarative device set: start added adapters, stop removed
    /// ones, restart changed ones, and honor the enabled toggle without
    /// deleting records.
    pub fn reconcile(&self, devices: Vec<SensorDevice>) {
        let mut running = self.running.lock().unwrap();

        // Removals first.
        let desired: HashMap<&str, &SensorDevice> =
            devices.iter().map(|d| (d.name.as_str(), d)).collect();
        let gone: Vec<String> = running
            .keys()
            .filter(|name| !desired.contains_key(name.as_str()))
            .cloned()
            .collect();
        for name in gone {
            if let Some(adapter) = running.remove(&name) {
                adapter.cancel.cancel();
                info!(sensor = %name, "adapter removed");
            }
        }

        for device in devices {
            let hash = config_hash(&device);
            match running.get(&device.name) {
                Some(existing)
                    if existing.config_hash == hash && existing.enabled == device.enabled =>
                {
                    continue;
                }
                Some(existing) => {
                    existing.cancel.cancel();
                    debug!(sensor = %device.name, "adapter config changed, restarting");
                }
                None => {}
            }

            if !device.enabled {
                // Disabled: keep the record, run nothing.
                let entry = RunningAdapter {
                    config_hash: hash,
                    enabled: false,
                    cancel: CancellationToken::new(),
                    health: Arc::new(Mutex::new(AdapterHealth::default())),
                    device: Arc::new(Mutex::new(device.clone())),
                };
                running.insert(device.name.clone(), entry);
                info!(sensor = %device.name, "adapter disabled");
                continue;
            }

            match self.spawn_adapter(&device, hash.clone()) {
                Ok(entry) => {
                    running.insert(device.name.clone(), entry);
                }
                Err(e) => {
                    warn!(sensor = %device.name, error = %e, "adapter not started");
                    let mut failed = device.clone();
                    failed.deployment_status = DeploymentStatus::Failed;
                    failed.deployment_error = Some(e.to_string());
                    failed.deployment_attempts += 1;
                    running.insert(
                        device.name.clone(),
                        RunningAdapter {
                            config_hash: hash,
                            enabled: true,
                            cancel: CancellationToken::new(),
                            health: Arc::new(Mutex::new(AdapterHealth::default())),
                            device: Arc::new(Mutex::new(failed)),
                        },
                    );
                }
            }
        }
    }

    fn spawn_adapter(
        &self,
        device: &SensorDevice,
        hash: String,
    ) -> Result<RunningAdapter, SensorError> {
        let factory = self
            .factories
            .get(&device.protocol)
            .ok_or_else(|| SensorError::UnknownProtocol(device.protocol.to_string()))?
            .clone();

        let cancel = CancellationToken::new();
        let health = Arc::new(Mutex::new(AdapterHealth::default()));
        let shared_device = Arc::new(Mutex::new({
            let mut d = device.clone();
            d.deployment_status = DeploymentStatus::Reconciling;
            d
        }));

        let loop_device = device.clone();
        let loop_health = health.clone();
        let loop_state = shared_device.clone();
        let loop_cancel = cancel.clone();
        let publisher = self.publisher.clone();
        let retry = self.retry.clone();

        tokio::spawn(async move {
            adapter_loop(
                factory,
                loop_device,
                loop_state,
                loop_health,
                publisher,
                retry,
                loop_cancel,
            )
            .await;
        });

        info!(sensor = %device.name, protocol = %device.protocol, "adapter starting");
        Ok(RunningAdapter {
            config_hash: hash,
            enabled: true,
            cancel,
            health,
            device: shared_device,
        })
    }

    /// Health summary per adapter, for the current-state report.
    pub fn health(&self) -> HashMap<String, AdapterHealth> {
        self.running
            .lock()
            .unwrap()
            .iter()
            .map(|(name, a)| (name.clone(), a.health.lock().unwrap().clone()))
            .collect()
    }

    /// The device records with their live deployment status.
    pub fn devices(&self) -> Vec<SensorDevice> {
        self.running
            .lock()
            .unwrap()
            .values()
            .map(|a| a.device.lock().unwrap().clone())
            .collect()
    }

    /// Stop every adapter loop. Called on shutdown.
    pub fn shutdown(&self) {
        let mut running = self.running.lock().unwrap();
        for (_, adapter) in running.drain() {
            adapter.cancel.cancel();
        }
    }
}

/// The connect → poll → publish loop for one adapter. Transient errors feed
/// the retry manager under `sensor:<name>`; the loop reconnects after a
/// failed poll and backs off after failed connects.
async fn adapter_loop(
    factory: Arc<dyn AdapterFactory>,
    device: SensorDevice,
    state: Arc<Mutex<SensorDevice>>,
    health: Arc<Mutex<AdapterHealth>>,
    publisher: Arc<dyn SensorPublisher>,
    retry: Arc<RetryManager>,
    cancel: CancellationToken,
) {
    let retry_key = format!("sensor:{}", device.name);
    let poll_interval = Duration::from_millis(device.poll_interval_ms.max(100));

    'outer: loop {
        if cancel.is_cancelled() {
            return;
        }
        if !retry.should_retry(&retry_key) {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(poll_interval) => continue,
            }
        }

        let mut adapter = match factory.create(&device) {
            Ok(a) => a,
            Err(e) => {
                record_failure(&state, &health, &retry, &retry_key, &e);
                return;
            }
        };

        match adapter.connect().await {
            Ok(()) => {
                retry.record_success(&retry_key);
                health.lock().unwrap().connected = true;
                let mut dev = state.lock().unwrap();
                dev.deployment_status = DeploymentStatus::Deployed;
                dev.last_deployed_at = Some(Utc::now());
                dev.deployment_error = None;
            }
            Err(e) => {
                record_failure(&state, &health, &retry, &retry_key, &e);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(poll_interval) => continue,
                }
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    adapter.disconnect().await;
                    return;
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }

            match adapter.poll().await {
                Ok(values) => {
                    health.lock().unwrap().last_poll = Some(Utc::now());
                    let reading = SensorReading {
                        device: device.name.clone(),
                        at: Utc::now(),
                        values,
                    };
                    if let Err(e) = publisher.publish(reading).await {
                        warn!(sensor = %device.name, error = %e, "publish failed");
                    }
                }
                Err(e) => {
                    record_failure(&state, &health, &retry, &retry_key, &e);
                    adapter.disconnect().await;
                    health.lock().unwrap().connected = false;
                    continue 'outer;
                }
            }
        }
    }
}

fn record_failure(
    state: &Arc<Mutex<SensorDevice>>,
    health: &Arc<Mutex<AdapterHealth>>,
    retry: &Arc<RetryManager>,
    key: &str,
    error: &SensorError,
) {
    retry.record_failure(key, error.to_string());
    {
        let mut h = health.lock().unwrap();
        h.error_count += 1;
        h.last_error = Some(error.to_string());
        h.connected = false;
    }
    let mut dev = state.lock().unwrap();
    dev.deployment_status = DeploymentStatus::Failed;
    dev.deployment_error = Some(error.to_string());
    dev.deployment_attempts += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_adapter::VirtualAdapterFactory;
    use async_trait::async_trait;
    use serde_json::json;
    use vigil_retry::RetryPolicy;

    struct ChannelPublisher {
        tx: tokio::sync::mpsc::Sender<SensorReading>,
    }

    #[async_trait]
    impl SensorPublisher for ChannelPublisher {
        async fn publish(&self, reading: SensorReading) -> Result<(), SensorError> {
            self.tx
                .send(reading)
                .await
                .map_err(|e| SensorError::PublishFailed(e.to_string()))
        }
    }

    fn device(name: &str, connection: serde_json::Value) -> SensorDevice {
        serde_json::from_value(json!({
            "name": name,
            "protocol": "virtual",
            "poll_interval_ms": 200,
            "connection": connection,
        }))
        .unwrap()
    }

    fn manager_with_factory() -> (
        AdapterManager,
        Arc<VirtualAdapterFactory>,
        tokio::sync::mpsc::Receiver<SensorReading>,
        Arc<RetryManager>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let retry = Arc::new(RetryManager::new(RetryPolicy::default()));
        let mut manager =
            AdapterManager::new(Arc::new(ChannelPublisher { tx }), retry.clone());
        let factory = Arc::new(VirtualAdapterFactory::new());
        manager.register(factory.clone());
        (manager, factory, rx, retry)
    }

    #[tokio::test(start_paused = true)]
    async fn added_device_connects_and_publishes() {
        let (manager, _factory, mut rx, _) = manager_with_factory();
        manager.reconcile(vec![device("virt-1", json!({"value": 42}))]);

        let reading = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("expected a published reading")
            .unwrap();
        assert_eq!(reading.device, "virt-1");
        assert_eq!(reading.values["value"], 42);

        let devices = manager.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].deployment_status, DeploymentStatus::Deployed);
        assert!(manager.health()["virt-1"].connected);
    }

    #[tokio::test(start_paused = true)]
    async fn removed_device_stops_publishing() {
        let (manager, _factory, mut rx, _) = manager_with_factory();
        manager.reconcile(vec![device("virt-1", json!({}))]);
        let _ = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();

        manager.reconcile(vec![]);
        assert!(manager.devices().is_empty());

        // Drain whatever was already queued, then expect silence.
        tokio::time::sleep(Duration::from_secs(1)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn config_change_restarts_adapter() {
        let (manager, factory, mut rx, _) = manager_with_factory();
        manager.reconcile(vec![device("virt-1", json!({"value": 1}))]);
        let _ = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(factory.create_count(), 1);

        manager.reconcile(vec![device("virt-1", json!({"value": 2}))]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(factory.create_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_config_keeps_adapter() {
        let (manager, factory, mut rx, _) = manager_with_factory();
        let dev = device("virt-1", json!({"value": 1}));
        manager.reconcile(vec![dev.clone()]);
        let _ = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();

        manager.reconcile(vec![dev]);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(factory.create_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disable_keeps_record_without_loop() {
        let (manager, _factory, mut rx, _) = manager_with_factory();
        manager.reconcile(vec![device("virt-1", json!({}))]);
        let _ = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();

        let mut disabled = device("virt-1", json!({}));
        disabled.enabled = false;
        manager.reconcile(vec![disabled]);

        let devices = manager.devices();
        assert_eq!(devices.len(), 1, "disabled device keeps its record");
        assert!(!devices[0].enabled);

        tokio::time::sleep(Duration::from_secs(1)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failure_marks_failed_and_backs_off() {
        let (manager, _factory, _rx, retry) = manager_with_factory();
        manager.reconcile(vec![device("virt-bad", json!({"fail_connect": true}))]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let devices = manager.devices();
        assert_eq!(devices[0].deployment_status, DeploymentStatus::Failed);
        assert!(devices[0].deployment_error.is_some());
        assert!(devices[0].deployment_attempts >= 1);
        assert!(retry.entry("sensor:virt-bad").is_some());
        assert!(!manager.health()["virt-bad"].connected);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_protocol_is_reported_not_fatal() {
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let retry = Arc::new(RetryManager::new(RetryPolicy::default()));
        // No factories registered at all.
        let manager = AdapterManager::new(Arc::new(ChannelPublisher { tx }), retry);
        manager.reconcile(vec![device("orphan", json!({}))]);

        let devices = manager.devices();
        assert_eq!(devices[0].deployment_status, DeploymentStatus::Failed);
        assert!(devices[0]
            .deployment_error
            .as_deref()
            .unwrap()
            .contains("no adapter registered"));
    }
}
