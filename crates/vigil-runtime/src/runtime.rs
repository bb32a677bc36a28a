use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::RuntimeError;

/// Label set on every container, volume and network this agent creates.
pub const MANAGED_LABEL: &str = "managed";

/// A flattened, runtime-neutral container creation request. Built by the
/// engine from a `Service`; the runtime never sees domain types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `(host, container, protocol)` port bindings.
    pub ports: Vec<(u16, u16, String)>,
    pub env: Vec<String>,
    /// `source:destination` strings; named volumes already resolved.
    pub binds: Vec<String>,
    pub networks: Vec<String>,
    pub labels: HashMap<String, String>,
    pub resources: Option<ResourceLimits>,
    pub restart_policy: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_millicores: Option<u64>,
    pub memory_bytes: Option<u64>,
}

/// Normalized inspect/list row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuntimeContainer {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    pub ip_address: Option<String>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i64,
    pub output: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Thin capability interface to the container runtime. Any runtime able to
/// pull images, run containers with port/volume/network wiring, exec with an
/// exit code, and CRUD labeled volumes/networks satisfies it.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    // ── Images ────────────────────────────────────────────────────────────────

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError>;

    // ── Containers ────────────────────────────────────────────────────────────

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn stop_container(&self, id: &str, grace_seconds: u32) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<RuntimeContainer, RuntimeError>;

    async fn list_containers(&self, managed_only: bool) -> Result<Vec<RuntimeContainer>, RuntimeError>;

    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult, RuntimeError>;

    // ── Volumes & networks ────────────────────────────────────────────────────

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError>;

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;

    async fn list_volumes(&self, managed_only: bool) -> Result<Vec<String>, RuntimeError>;

    async fn create_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError>;

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError>;

    async fn list_networks(&self, managed_only: bool) -> Result<Vec<String>, RuntimeError>;
}
