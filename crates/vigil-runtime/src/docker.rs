//! Docker implementation of [`ContainerRuntime`] over bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::debug;

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecResult, RuntimeContainer};

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon. An empty socket path uses the
    /// platform defaults (`DOCKER_HOST` or the standard unix socket).
    pub fn connect(socket_path: &str) -> Result<Self, RuntimeError> {
        let client = if socket_path.is_empty() {
            Docker::connect_with_defaults()
                .map_err(|e| RuntimeError::ConnectionFailed(e.to_string()))?
        } else {
            let clean_path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(clean_path, 120, &bollard::API_DEFAULT_VERSION)
                .map_err(|e| RuntimeError::ConnectionFailed(e.to_string()))?
        };
        Ok(Self { client })
    }

    /// Verify the daemon is reachable. Called once at boot; an unreachable
    /// runtime is a fatal startup fault.
    pub async fn ping(&self) -> Result<(), RuntimeError> {
        self.client.ping().await.map_err(RuntimeError::from)?;
        Ok(())
    }

}

const MANAGED_FILTER: &str = "managed=true";

/// Split `nginx:alpine` into `("nginx", "alpine")`. A colon inside the
/// registry host (`registry:5000/app`) is not a tag separator.
fn split_image_ref(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, "latest"),
    }
}

fn restart_policy_name(policy: &str) -> bollard::models::RestartPolicyNameEnum {
    use bollard::models::RestartPolicyNameEnum;
    match policy {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        _ => RestartPolicyNameEnum::NO,
    }
}

fn normalize_inspect(resp: bollard::models::ContainerInspectResponse) -> RuntimeContainer {
    let ip_address = resp
        .network_settings
        .as_ref()
        .and_then(|ns| ns.networks.as_ref())
        .and_then(|nets| {
            nets.values()
                .filter_map(|ep| ep.ip_address.clone())
                .find(|ip| !ip.is_empty())
        });
    RuntimeContainer {
        id: resp.id.unwrap_or_default(),
        name: resp
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: resp.config.as_ref().and_then(|c| c.image.clone()).unwrap_or_default(),
        running: resp.state.as_ref().and_then(|s| s.running).unwrap_or(false),
        ip_address,
        labels: resp.config.and_then(|c| c.labels).unwrap_or_default(),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        use bollard::query_parameters::CreateImageOptions;

        let (name, tag) = split_image_ref(image);
        let options = Some(CreateImageOptions {
            from_image: Some(name.to_string()),
            tag: Some(tag.to_string()),
            ..Default::default()
        });

        let mut stream = self.client.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => debug!(status = ?info.status, image, "image pull progress"),
                Err(e) => return Err(RuntimeError::from(e)),
            }
        }
        Ok(())
    }

    async fn image_present(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::from(e)),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        use bollard::models::{
            ContainerCreateBody, HostConfig, PortBinding, RestartPolicy,
        };
        use bollard::query_parameters::CreateContainerOptions;

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        let mut exposed_ports: Vec<String> = Vec::new();
        for (host, container, protocol) in &spec.ports {
            let key = format!("{}/{}", container, protocol);
            exposed_ports.push(key.clone());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            port_bindings: if port_bindings.is_empty() { None } else { Some(port_bindings) },
            binds: if spec.binds.is_empty() { None } else { Some(spec.binds.clone()) },
            nano_cpus: spec
                .resources
                .and_then(|r| r.cpu_millicores)
                .map(|m| (m as i64) * 1_000_000),
            memory: spec.resources.and_then(|r| r.memory_bytes).map(|b| b as i64),
            restart_policy: spec.restart_policy.as_deref().map(|p| RestartPolicy {
                name: Some(restart_policy_name(p)),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: if spec.env.is_empty() { None } else { Some(spec.env.clone()) },
            labels: Some(spec.labels.clone()),
            exposed_ports: if exposed_ports.is_empty() { None } else { Some(exposed_ports) },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = Some(CreateContainerOptions {
            name: Some(spec.name.clone()),
            ..Default::default()
        });

        let created = self.client.create_container(options, body).await?;

        // Attach every requested network before start; creation can only
        // wire one endpoint.
        for network in &spec.networks {
            use bollard::models::NetworkConnectRequest;
            let request = NetworkConnectRequest {
                container: created.id.clone(),
                ..Default::default()
            };
            self.client.connect_network(network, request).await?;
        }

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.client
            .start_container(id, None::<bollard::query_parameters::StartContainerOptions>)
            .await
            .map_err(RuntimeError::from)
    }

    async fn stop_container(&self, id: &str, grace_seconds: u32) -> Result<(), RuntimeError> {
        use bollard::query_parameters::StopContainerOptions;

        let options = Some(StopContainerOptions {
            t: Some(grace_seconds as i32),
            ..Default::default()
        });
        match self.client.stop_container(id, options).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::from(e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        use bollard::query_parameters::RemoveContainerOptions;

        let options = Some(RemoveContainerOptions { force: true, ..Default::default() });
        self.client
            .remove_container(id, options)
            .await
            .map_err(RuntimeError::from)
    }

    async fn inspect_container(&self, id: &str) -> Result<RuntimeContainer, RuntimeError> {
        let resp = self
            .client
            .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await?;
        Ok(normalize_inspect(resp))
    }

    async fn list_containers(
        &self,
        managed_only: bool,
    ) -> Result<Vec<RuntimeContainer>, RuntimeError> {
        use bollard::query_parameters::ListContainersOptionsBuilder;

        let mut filters: HashMap<&str, Vec<&str>> = HashMap::new();
        if managed_only {
            filters.insert("label", vec![MANAGED_FILTER]);
        }
        let options = ListContainersOptionsBuilder::default()
            .all(true)
            .filters(&filters)
            .build();
        let summaries = self.client.list_containers(Some(options)).await?;
        Ok(summaries
            .into_iter()
            .map(|c| RuntimeContainer {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .as_deref()
                    .and_then(|ns| ns.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                running: c
                    .state
                    .map(|s| s.to_string().eq_ignore_ascii_case("running"))
                    .unwrap_or(false),
                ip_address: None,
                labels: c.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecResult, RuntimeError> {
        use bollard::exec::{StartExecOptions, StartExecResults};
        use bollard::models::ExecConfig;

        let config = ExecConfig {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(command.to_vec()),
            ..Default::default()
        };
        let exec = self.client.create_exec(id, config).await?;

        let mut output = String::new();
        let started = self
            .client
            .start_exec(exec.id.as_str(), Some(StartExecOptions::default()))
            .await?;
        if let StartExecResults::Attached { output: mut stream, .. } = started {
            while let Some(chunk) = stream.next().await {
                if let Ok(log) = chunk {
                    output.push_str(&log.to_string());
                }
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        Ok(ExecResult { exit_code: inspect.exit_code.unwrap_or(-1), output })
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        use bollard::models::VolumeCreateRequest;

        let config = VolumeCreateRequest {
            name: Some(name.to_string()),
            driver: Some("local".to_string()),
            labels: Some(labels),
            ..Default::default()
        };
        self.client.create_volume(config).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        use bollard::query_parameters::RemoveVolumeOptions;

        self.client
            .remove_volume(name, Some(RemoveVolumeOptions { force: false }))
            .await
            .map_err(RuntimeError::from)
    }

    async fn list_volumes(&self, managed_only: bool) -> Result<Vec<String>, RuntimeError> {
        use bollard::query_parameters::ListVolumesOptionsBuilder;

        let mut filters: HashMap<&str, Vec<&str>> = HashMap::new();
        if managed_only {
            filters.insert("label", vec![MANAGED_FILTER]);
        }
        let options = ListVolumesOptionsBuilder::default().filters(&filters).build();
        let resp = self.client.list_volumes(Some(options)).await?;
        Ok(resp
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .collect())
    }

    async fn create_network(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        use bollard::models::NetworkCreateRequest;

        let config = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            labels: Some(labels),
            ..Default::default()
        };
        self.client.create_network(config).await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.client.remove_network(name).await.map_err(RuntimeError::from)
    }

    async fn list_networks(&self, managed_only: bool) -> Result<Vec<String>, RuntimeError> {
        use bollard::query_parameters::ListNetworksOptionsBuilder;

        let mut filters: HashMap<&str, Vec<&str>> = HashMap::new();
        if managed_only {
            filters.insert("label", vec![MANAGED_FILTER]);
        }
        let options = ListNetworksOptionsBuilder::default().filters(&filters).build();
        let networks = self.client.list_networks(Some(options)).await?;
        Ok(networks.into_iter().filter_map(|n| n.name).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_splits_tag() {
        assert_eq!(split_image_ref("nginx:alpine"), ("nginx", "alpine"));
        assert_eq!(split_image_ref("nginx"), ("nginx", "latest"));
        assert_eq!(
            split_image_ref("registry:5000/app"),
            ("registry:5000/app", "latest")
        );
        assert_eq!(
            split_image_ref("registry:5000/app:v2"),
            ("registry:5000/app", "v2")
        );
    }

    #[test]
    fn restart_policy_maps() {
        use bollard::models::RestartPolicyNameEnum;
        assert_eq!(restart_policy_name("always"), RestartPolicyNameEnum::ALWAYS);
        assert_eq!(
            restart_policy_name("unless-stopped"),
            RestartPolicyNameEnum::UNLESS_STOPPED
        );
        assert_eq!(restart_policy_name("bogus"), RestartPolicyNameEnum::NO);
    }
}
