use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Startup,
    Liveness,
    Readiness,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProbeKind::Startup => "startup",
            ProbeKind::Liveness => "liveness",
            ProbeKind::Readiness => "readiness",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

/// Per container × probe type accounting.
///
/// The threshold state machine is pure: timers feed results in via
/// [`ProbeState::observe`], which reports a transition when one occurs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeState {
    pub status: ProbeStatus,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
}

impl ProbeState {
    /// Account one check result. Returns `Some(new_status)` iff the status
    /// transitioned on this observation.
    pub fn observe(
        &mut self,
        success: bool,
        success_threshold: u32,
        failure_threshold: u32,
        now: DateTime<Utc>,
        message: Option<String>,
    ) -> Option<ProbeStatus> {
        self.last_check = Some(now);
        self.last_message = message;
        if success {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
            if self.status != ProbeStatus::Healthy
                && self.consecutive_successes >= success_threshold
            {
                self.status = ProbeStatus::Healthy;
                return Some(ProbeStatus::Healthy);
            }
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
            if self.status != ProbeStatus::Unhealthy
                && self.consecutive_failures >= failure_threshold
            {
                self.status = ProbeStatus::Unhealthy;
                return Some(ProbeStatus::Unhealthy);
            }
        }
        None
    }
}

/// Snapshot of all probe state for one monitored container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerHealth {
    pub container_id: String,
    pub app_id: vigil_domain::AppId,
    pub service_id: vigil_domain::ServiceId,
    pub probes: HashMap<ProbeKind, ProbeState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observe(state: &mut ProbeState, success: bool, st: u32, ft: u32) -> Option<ProbeStatus> {
        state.observe(success, st, ft, Utc::now(), None)
    }

    #[test]
    fn transitions_healthy_at_success_threshold() {
        let mut st = ProbeState::default();
        assert_eq!(observe(&mut st, true, 2, 3), None);
        assert_eq!(observe(&mut st, true, 2, 3), Some(ProbeStatus::Healthy));
        // Already healthy: no repeat event.
        assert_eq!(observe(&mut st, true, 2, 3), None);
    }

    #[test]
    fn transitions_unhealthy_at_failure_threshold() {
        let mut st = ProbeState::default();
        observe(&mut st, true, 1, 3);
        assert_eq!(st.status, ProbeStatus::Healthy);
        assert_eq!(observe(&mut st, false, 1, 3), None);
        assert_eq!(observe(&mut st, false, 1, 3), None);
        assert_eq!(observe(&mut st, false, 1, 3), Some(ProbeStatus::Unhealthy));
        assert_eq!(st.consecutive_failures, 3);
    }

    #[test]
    fn success_resets_failure_streak() {
        let mut st = ProbeState::default();
        observe(&mut st, false, 1, 3);
        observe(&mut st, false, 1, 3);
        observe(&mut st, true, 1, 3);
        assert_eq!(st.consecutive_failures, 0);
        assert_eq!(st.status, ProbeStatus::Healthy);
        // The earlier failures no longer count toward the threshold.
        observe(&mut st, false, 1, 3);
        observe(&mut st, false, 1, 3);
        assert_eq!(st.status, ProbeStatus::Healthy);
    }

    #[test]
    fn recovers_after_unhealthy() {
        let mut st = ProbeState::default();
        for _ in 0..3 {
            observe(&mut st, false, 1, 3);
        }
        assert_eq!(st.status, ProbeStatus::Unhealthy);
        assert_eq!(observe(&mut st, true, 1, 3), Some(ProbeStatus::Healthy));
    }
}
