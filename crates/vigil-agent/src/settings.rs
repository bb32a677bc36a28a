use std::path::PathBuf;

use clap::Parser;

/// Agent configuration, from flags or `VIGIL_*` environment variables.
#[derive(Debug, Clone, Parser)]
#[command(name = "vigil", about = "IoT edge device supervisor", version)]
pub struct Settings {
    /// Cloud control-plane base URL. Without it the agent runs offline.
    #[arg(long, env = "VIGIL_CLOUD_URL")]
    pub cloud_url: Option<String>,

    /// Fleet provisioning key, used once for the registration handshake.
    #[arg(long, env = "VIGIL_FLEET_KEY")]
    pub fleet_key: Option<String>,

    /// Human-readable device name sent at registration.
    #[arg(long, env = "VIGIL_DEVICE_NAME")]
    pub device_name: Option<String>,

    /// Directory holding the state database.
    #[arg(long, env = "VIGIL_DATA_DIR", default_value = "/var/lib/vigil")]
    pub data_dir: PathBuf,

    /// Docker socket path; empty uses the platform default.
    #[arg(long, env = "VIGIL_DOCKER_SOCKET", default_value = "")]
    pub docker_socket: String,

    /// MQTT broker as host:port. Without it MQTT features are off.
    #[arg(long, env = "VIGIL_MQTT_BROKER")]
    pub mqtt_broker: Option<String>,

    /// Base topic for outbound publications.
    #[arg(long, env = "VIGIL_MQTT_BASE_TOPIC", default_value = "vigil")]
    pub mqtt_base_topic: String,

    /// Override the target-state poll interval.
    #[arg(long, env = "VIGIL_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Override the current-state report interval.
    #[arg(long, env = "VIGIL_REPORT_INTERVAL_MS")]
    pub report_interval_ms: Option<u64>,

    /// Override the auto-reconcile interval.
    #[arg(long, env = "VIGIL_RECONCILE_INTERVAL_MS")]
    pub reconcile_interval_ms: Option<u64>,

    /// Job poll interval.
    #[arg(long, env = "VIGIL_JOB_POLL_INTERVAL_MS", default_value_t = 15_000)]
    pub job_poll_interval_ms: u64,

    /// Log shipping flush interval.
    #[arg(long, env = "VIGIL_LOG_FLUSH_INTERVAL_MS", default_value_t = 5_000)]
    pub log_flush_interval_ms: u64,

    /// Log shipping max batch size.
    #[arg(long, env = "VIGIL_LOG_MAX_BATCH", default_value_t = 100)]
    pub log_max_batch: usize,
}

impl Settings {
    /// `host:port` broker address, defaulting the port to 1883.
    pub fn mqtt_host_port(&self) -> Option<(String, u16)> {
        let raw = self.mqtt_broker.as_deref()?;
        match raw.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse().unwrap_or(1883);
                Some((host.to_string(), port))
            }
            None => Some((raw.to_string(), 1883)),
        }
    }
}
