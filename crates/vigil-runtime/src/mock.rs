//! In-memory [`ContainerRuntime`] with scriptable failures, used by engine
//! and prober tests the way a stub driver backs reconciler tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecResult, RuntimeContainer};

#[derive(Debug, Default)]
struct Inner {
    images: HashSet<String>,
    containers: HashMap<String, (ContainerSpec, RuntimeContainer)>,
    volumes: HashMap<String, HashMap<String, String>>,
    networks: HashMap<String, HashMap<String, String>>,
    fail_pulls: HashSet<String>,
    fail_starts: HashSet<String>,
    exec_exit_codes: HashMap<String, i64>,
    calls: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MockRuntime {
    inner: Arc<Mutex<Inner>>,
    next_id: Arc<AtomicU64>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent pull of `image` fails until `clear_pull_failure`.
    pub fn fail_pull(&self, image: &str) {
        self.inner.lock().unwrap().fail_pulls.insert(image.to_string());
    }

    pub fn clear_pull_failure(&self, image: &str) {
        self.inner.lock().unwrap().fail_pulls.remove(image);
    }

    /// Every subsequent start of a container named `name` fails.
    pub fn fail_start(&self, name: &str) {
        self.inner.lock().unwrap().fail_starts.insert(name.to_string());
    }

    pub fn clear_start_failure(&self, name: &str) {
        self.inner.lock().unwrap().fail_starts.remove(name);
    }

    /// Exit code returned by `exec` inside container `id` (default 0).
    pub fn set_exec_exit_code(&self, id: &str, code: i64) {
        self.inner.lock().unwrap().exec_exit_codes.insert(id.to_string(), code);
    }

    /// Ordered log of mutating calls, e.g. `"pull nginx:alpine"`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn running_containers(&self) -> Vec<RuntimeContainer> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|(_, c)| c.running)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn record(inner: &mut Inner, call: String) {
        inner.calls.push(call);
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, format!("pull {}", image));
        if inner.fail_pulls.contains(image) {
            return Err(RuntimeError::ImageNotFound(format!("manifest unknown: {}", image)));
        }
        inner.images.insert(image.to_string());
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        Ok(self.inner.lock().unwrap().images.contains(image))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, format!("create {}", spec.name));
        if !inner.images.contains(&spec.image) {
            return Err(RuntimeError::ImageNotFound(spec.image.clone()));
        }
        let octet = 2 + (inner.containers.len() as u8 % 250);
        let container = RuntimeContainer {
            id: id.clone(),
            name: spec.name.clone(),
            image: spec.image.clone(),
            running: false,
            ip_address: Some(format!("172.17.0.{}", octet)),
            labels: spec.labels.clone(),
        };
        inner.containers.insert(id.clone(), (spec.clone(), container));
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, format!("start {}", id));
        let fail = {
            let (spec, _) = inner
                .containers
                .get(id)
                .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))?;
            inner.fail_starts.contains(&spec.name)
        };
        if fail {
            return Err(RuntimeError::Api(format!("cannot start {}: exit 1", id)));
        }
        if let Some((_, container)) = inner.containers.get_mut(id) {
            container.running = true;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace_seconds: u32) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, format!("stop {}", id));
        match inner.containers.get_mut(id) {
            Some((_, container)) => {
                container.running = false;
                Ok(())
            }
            None => Err(RuntimeError::ContainerNotFound(id.to_string())),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, format!("remove {}", id));
        inner
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))
    }

    async fn inspect_container(&self, id: &str) -> Result<RuntimeContainer, RuntimeError> {
        self.inner
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|(_, c)| c.clone())
            .ok_or_else(|| RuntimeError::ContainerNotFound(id.to_string()))
    }

    async fn list_containers(
        &self,
        managed_only: bool,
    ) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|(_, c)| !managed_only || c.labels.contains_key(crate::MANAGED_LABEL))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult, RuntimeError> {
        let inner = self.inner.lock().unwrap();
        if !inner.containers.contains_key(id) {
            return Err(RuntimeError::ContainerNotFound(id.to_string()));
        }
        let exit_code = inner.exec_exit_codes.get(id).copied().unwrap_or(0);
        Ok(ExecResult { exit_code, output: command.join(" ") })
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, format!("create-volume {}", name));
        inner.volumes.insert(name.to_string(), labels);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, format!("remove-volume {}", name));
        inner.volumes.remove(name);
        Ok(())
    }

    async fn list_volumes(&self, _managed_only: bool) -> Result<Vec<String>, RuntimeError> {
        Ok(self.inner.lock().unwrap().volumes.keys().cloned().collect())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, format!("create-network {}", name));
        inner.networks.insert(name.to_string(), labels);
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        Self::record(&mut inner, format!("remove-network {}", name));
        inner.networks.remove(name);
        Ok(())
    }

    async fn list_networks(&self, _managed_only: bool) -> Result<Vec<String>, RuntimeError> {
        Ok(self.inner.lock().unwrap().networks.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, image: &str) -> ContainerSpec {
        ContainerSpec { name: name.into(), image: image.into(), ..Default::default() }
    }

    #[tokio::test]
    async fn container_lifecycle() {
        let rt = MockRuntime::new();
        rt.pull_image("nginx:alpine").await.unwrap();
        let id = rt.create_container(&spec("web", "nginx:alpine")).await.unwrap();
        rt.start_container(&id).await.unwrap();
        assert!(rt.inspect_container(&id).await.unwrap().running);
        rt.stop_container(&id, 10).await.unwrap();
        rt.remove_container(&id).await.unwrap();
        assert!(rt.inspect_container(&id).await.is_err());
    }

    #[tokio::test]
    async fn scripted_pull_failure() {
        let rt = MockRuntime::new();
        rt.fail_pull("nodered:does-not-exist");
        assert!(rt.pull_image("nodered:does-not-exist").await.is_err());
        rt.clear_pull_failure("nodered:does-not-exist");
        assert!(rt.pull_image("nodered:does-not-exist").await.is_ok());
    }

    #[tokio::test]
    async fn create_requires_pulled_image() {
        let rt = MockRuntime::new();
        assert!(matches!(
            rt.create_container(&spec("web", "ghost:latest")).await,
            Err(RuntimeError::ImageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn exec_exit_codes_are_scriptable() {
        let rt = MockRuntime::new();
        rt.pull_image("busybox").await.unwrap();
        let id = rt.create_container(&spec("tool", "busybox")).await.unwrap();
        assert!(rt.exec(&id, &["true".into()]).await.unwrap().success());
        rt.set_exec_exit_code(&id, 7);
        assert_eq!(rt.exec(&id, &["false".into()]).await.unwrap().exit_code, 7);
    }

    #[tokio::test]
    async fn calls_are_recorded_in_order() {
        let rt = MockRuntime::new();
        rt.pull_image("a").await.unwrap();
        rt.create_volume("1_data", HashMap::new()).await.unwrap();
        let calls = rt.calls();
        assert_eq!(calls, vec!["pull a", "create-volume 1_data"]);
    }
}
