use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A periodic health check the agent runs against a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Probe {
    #[serde(flatten)]
    pub handler: ProbeHandler,
    #[serde(default)]
    pub initial_delay_seconds: u64,
    #[serde(default = "default_period_seconds")]
    pub period_seconds: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_period_seconds() -> u64 {
    10
}

fn default_timeout_seconds() -> u64 {
    1
}

fn default_threshold() -> u32 {
    1
}

fn default_failure_threshold() -> u32 {
    3
}

impl Probe {
    pub fn http(path: impl Into<String>, port: u16) -> Self {
        Self::with_handler(ProbeHandler::Http {
            path: path.into(),
            port,
            scheme: default_scheme(),
            headers: HashMap::new(),
            expected_status: None,
        })
    }

    pub fn tcp(port: u16) -> Self {
        Self::with_handler(ProbeHandler::Tcp { port })
    }

    pub fn exec(command: Vec<String>) -> Self {
        Self::with_handler(ProbeHandler::Exec { command })
    }

    fn with_handler(handler: ProbeHandler) -> Self {
        Self {
            handler,
            initial_delay_seconds: 0,
            period_seconds: default_period_seconds(),
            timeout_seconds: default_timeout_seconds(),
            success_threshold: default_threshold(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Closed sum of check mechanisms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProbeHandler {
    Http {
        path: String,
        port: u16,
        #[serde(default = "default_scheme")]
        scheme: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Inclusive status range counted as success; default 200..=399.
        #[serde(default)]
        expected_status: Option<(u16, u16)>,
    },
    Tcp {
        port: u16,
    },
    Exec {
        command: Vec<String>,
    },
}

fn default_scheme() -> String {
    "http".to_string()
}

impl ProbeHandler {
    /// Whether `status` counts as a passing HTTP response for this handler.
    pub fn http_status_ok(&self, status: u16) -> bool {
        match self {
            ProbeHandler::Http { expected_status, .. } => {
                let (lo, hi) = expected_status.unwrap_or((200, 399));
                status >= lo && status <= hi
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_defaults_apply() {
        let p: Probe = serde_json::from_value(serde_json::json!({
            "type": "http",
            "path": "/healthz",
            "port": 8080
        }))
        .unwrap();
        assert_eq!(p.period_seconds, 10);
        assert_eq!(p.timeout_seconds, 1);
        assert_eq!(p.success_threshold, 1);
        assert_eq!(p.failure_threshold, 3);
        assert_eq!(p.initial_delay_seconds, 0);
        match p.handler {
            ProbeHandler::Http { ref scheme, .. } => assert_eq!(scheme, "http"),
            _ => panic!("expected http handler"),
        }
    }

    #[test]
    fn tagged_handlers_round_trip() {
        for p in [
            Probe::http("/", 80),
            Probe::tcp(5432),
            Probe::exec(vec!["true".into()]),
        ] {
            let json = serde_json::to_string(&p).unwrap();
            let back: Probe = serde_json::from_str(&json).unwrap();
            assert_eq!(back, p);
        }
    }

    #[test]
    fn default_expected_status_range() {
        let p = Probe::http("/", 80);
        assert!(p.handler.http_status_ok(200));
        assert!(p.handler.http_status_ok(302));
        assert!(p.handler.http_status_ok(399));
        assert!(!p.handler.http_status_ok(400));
        assert!(!p.handler.http_status_ok(500));
    }

    #[test]
    fn explicit_expected_status_range() {
        let mut p = Probe::http("/", 80);
        if let ProbeHandler::Http { ref mut expected_status, .. } = p.handler {
            *expected_status = Some((200, 200));
        }
        assert!(p.handler.http_status_ok(200));
        assert!(!p.handler.http_status_ok(204));
    }
}
