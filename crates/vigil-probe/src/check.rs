use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use vigil_domain::ProbeHandler;
use vigil_runtime::ContainerRuntime;

/// Result of a single probe invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
}

impl CheckOutcome {
    fn finish(success: bool, message: impl Into<String>, started: Instant) -> Self {
        Self {
            success,
            message: message.into(),
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Run one check against a container, bounded by `deadline`. Never blocks
/// past the deadline; a timeout is a failure, not an error.
pub async fn run_check(
    http: &reqwest::Client,
    runtime: &Arc<dyn ContainerRuntime>,
    container_id: &str,
    container_ip: Option<&str>,
    handler: &ProbeHandler,
    deadline: Duration,
) -> CheckOutcome {
    let started = Instant::now();
    match handler {
        ProbeHandler::Http { path, port, scheme, headers, .. } => {
            let Some(ip) = container_ip else {
                return CheckOutcome::finish(false, "container has no ip address", started);
            };
            let url = format!("{}://{}:{}{}", scheme, ip, port, path);
            let mut request = http.get(&url).timeout(deadline);
            for (name, value) in headers {
                request = request.header(name, value);
            }
            match timeout(deadline, request.send()).await {
                Ok(Ok(resp)) => {
                    let status = resp.status().as_u16();
                    CheckOutcome::finish(
                        handler.http_status_ok(status),
                        format!("GET {} -> {}", url, status),
                        started,
                    )
                }
                Ok(Err(e)) => CheckOutcome::finish(false, format!("GET {}: {}", url, e), started),
                Err(_) => CheckOutcome::finish(false, format!("GET {}: timed out", url), started),
            }
        }
        ProbeHandler::Tcp { port } => {
            let Some(ip) = container_ip else {
                return CheckOutcome::finish(false, "container has no ip address", started);
            };
            let addr = format!("{}:{}", ip, port);
            match timeout(deadline, tokio::net::TcpStream::connect(&addr)).await {
                Ok(Ok(_)) => CheckOutcome::finish(true, format!("tcp {} connected", addr), started),
                Ok(Err(e)) => CheckOutcome::finish(false, format!("tcp {}: {}", addr, e), started),
                Err(_) => CheckOutcome::finish(false, format!("tcp {}: timed out", addr), started),
            }
        }
        ProbeHandler::Exec { command } => {
            match timeout(deadline, runtime.exec(container_id, command)).await {
                Ok(Ok(result)) => CheckOutcome::finish(
                    result.success(),
                    format!("exec exited {}", result.exit_code),
                    started,
                ),
                Ok(Err(e)) => CheckOutcome::finish(false, format!("exec failed: {}", e), started),
                Err(_) => CheckOutcome::finish(false, "exec timed out", started),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_runtime::{ContainerSpec, MockRuntime};

    async fn mock_with_container() -> (Arc<dyn ContainerRuntime>, String) {
        let rt = MockRuntime::new();
        rt.pull_image("busybox").await.unwrap();
        let id = rt
            .create_container(&ContainerSpec {
                name: "probe-target".into(),
                image: "busybox".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let dyn_rt: Arc<dyn ContainerRuntime> = Arc::new(rt.clone());
        rt.set_exec_exit_code(&id, 0);
        (dyn_rt, id)
    }

    #[tokio::test]
    async fn exec_check_succeeds_on_zero_exit() {
        let (rt, id) = mock_with_container().await;
        let http = reqwest::Client::new();
        let handler = ProbeHandler::Exec { command: vec!["true".into()] };
        let outcome =
            run_check(&http, &rt, &id, None, &handler, Duration::from_secs(1)).await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn tcp_check_connects_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (rt, id) = mock_with_container().await;
        let http = reqwest::Client::new();

        let handler = ProbeHandler::Tcp { port };
        let ok = run_check(&http, &rt, &id, Some("127.0.0.1"), &handler, Duration::from_secs(1))
            .await;
        assert!(ok.success);

        drop(listener);
        let closed =
            run_check(&http, &rt, &id, Some("127.0.0.1"), &handler, Duration::from_secs(1)).await;
        assert!(!closed.success);
    }

    #[tokio::test]
    async fn missing_ip_fails_network_checks() {
        let (rt, id) = mock_with_container().await;
        let http = reqwest::Client::new();
        let handler = ProbeHandler::Tcp { port: 80 };
        let outcome = run_check(&http, &rt, &id, None, &handler, Duration::from_secs(1)).await;
        assert!(!outcome.success);
        assert!(outcome.message.contains("no ip address"));
    }
}
