//! The target-poll and current-report loops.
//!
//! Both loops run until cancelled, tolerate transport errors with a warning
//! (the next tick retries), and apply the 401 discipline via
//! [`crate::provision::recover_unauthorized`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use vigil_domain::DeviceGraph;
use vigil_store::{state_hash, StateStore};

use crate::client::CloudApi;
use crate::error::CloudError;
use crate::provision::recover_unauthorized;
use crate::report::CurrentStateReport;

/// Where a fetched target document goes: the container manager and the
/// adapter manager, wired by the supervisor.
#[async_trait]
pub trait TargetHandler: Send + Sync + 'static {
    async fn apply_target(&self, graph: DeviceGraph);
}

/// Produces the report for the report loop.
#[async_trait]
pub trait ReportSource: Send + Sync + 'static {
    async fn current_report(&self) -> CurrentStateReport;
}

/// Poll `/device/:uuid/state` until cancelled. Unchanged documents (304 or
/// identical hash) are dropped without touching the handler.
pub async fn run_target_poll(
    api: Arc<CloudApi>,
    store: Arc<dyn StateStore>,
    uuid: String,
    interval: Duration,
    handler: Arc<dyn TargetHandler>,
    cancel: CancellationToken,
) {
    let mut last_hash: Option<String> = None;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut had_unauthorized = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        match api.fetch_target(&uuid).await {
            Ok(Some(graph)) => {
                had_unauthorized = false;
                let hash = state_hash(&graph);
                if last_hash.as_deref() == Some(hash.as_str()) {
                    debug!("target unchanged, skipping");
                    continue;
                }
                last_hash = Some(hash);
                handler.apply_target(graph).await;
            }
            Ok(None) => {
                had_unauthorized = false;
                debug!("target poll returned 304");
            }
            Err(CloudError::Unauthorized) => {
                if handle_unauthorized(&api, &store, &mut had_unauthorized, &cancel).await {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "target poll failed"),
        }
    }
}

/// PATCH the current-state report on a fixed cadence until cancelled.
pub async fn run_report_loop(
    api: Arc<CloudApi>,
    store: Arc<dyn StateStore>,
    interval: Duration,
    source: Arc<dyn ReportSource>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut had_unauthorized = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let report = source.current_report().await;
        match api.report_state(&report).await {
            Ok(()) => had_unauthorized = false,
            Err(CloudError::Unauthorized) => {
                if handle_unauthorized(&api, &store, &mut had_unauthorized, &cancel).await {
                    return;
                }
            }
            Err(e) => warn!(error = %e, "state report failed"),
        }
    }
}

/// Shared 401 handling: first strike re-exchanges the key, second strike
/// attempts full re-provisioning; an exhausted identity stops the loop.
/// Returns true when the caller must exit.
async fn handle_unauthorized(
    api: &Arc<CloudApi>,
    store: &Arc<dyn StateStore>,
    had_unauthorized: &mut bool,
    cancel: &CancellationToken,
) -> bool {
    if cancel.is_cancelled() {
        return true;
    }
    if !*had_unauthorized {
        *had_unauthorized = true;
        warn!("cloud rejected device key, attempting recovery");
    }
    match recover_unauthorized(store, api).await {
        Ok(_) => {
            *had_unauthorized = false;
            false
        }
        Err(CloudError::AuthExhausted) => {
            warn!("identity unrecoverable, stopping cloud loop");
            true
        }
        Err(e) => {
            warn!(error = %e, "auth recovery failed, will retry");
            false
        }
    }
}
