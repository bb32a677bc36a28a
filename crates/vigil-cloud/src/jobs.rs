//! Job polling and acknowledgement. Execution itself lives behind
//! [`JobHandler`]; the supervisor decides what job kinds the device honors.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client::CloudApi;

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Failed,
    Rejected,
}

impl JobOutcome {
    pub fn completed(output: Option<Value>) -> Self {
        Self { status: JobStatus::Completed, output, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { status: JobStatus::Failed, output: None, error: Some(error.into()) }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self { status: JobStatus::Rejected, output: None, error: Some(error.into()) }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &Job) -> JobOutcome;
}

/// Default handler: every job kind is rejected but still acked, so the
/// cloud queue never wedges on an unsupported device.
pub struct RejectAllHandler;

#[async_trait]
impl JobHandler for RejectAllHandler {
    async fn handle(&self, job: &Job) -> JobOutcome {
        JobOutcome::rejected(format!("unsupported job kind: {}", job.kind))
    }
}

/// Poll for jobs until cancelled. Every fetched job is acked exactly once,
/// whatever the handler decides.
pub async fn run_job_poller(
    api: Arc<CloudApi>,
    uuid: String,
    interval: Duration,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let job = match api.next_job(&uuid).await {
            Ok(Some(job)) => job,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "job poll failed");
                continue;
            }
        };

        info!(job_id = %job.id, kind = %job.kind, "job received");
        let outcome = handler.handle(&job).await;
        if let Err(e) = api.ack_job(&uuid, &job.id, &outcome).await {
            warn!(job_id = %job.id, error = %e, "job ack failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct EchoHandler;

    #[async_trait]
    impl JobHandler for EchoHandler {
        async fn handle(&self, job: &Job) -> JobOutcome {
            JobOutcome::completed(Some(job.payload.clone()))
        }
    }

    #[tokio::test]
    async fn fetched_job_is_handled_and_acked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices/uuid-1/jobs/next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "job-1",
                "kind": "echo",
                "payload": { "text": "hello" }
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/devices/uuid-1/jobs/job-1/status"))
            .and(body_string_contains("completed"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1..)
            .mount(&server)
            .await;

        let api = Arc::new(CloudApi::new(server.uri(), "device-key"));
        let cancel = CancellationToken::new();
        let poller = tokio::spawn(run_job_poller(
            api,
            "uuid-1".into(),
            Duration::from_millis(20),
            Arc::new(EchoHandler),
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        poller.await.unwrap();
    }

    #[tokio::test]
    async fn reject_all_handler_acks_with_rejection() {
        let job = Job { id: "j".into(), kind: "firmware-update".into(), payload: Value::Null };
        let outcome = RejectAllHandler.handle(&job).await;
        assert_eq!(outcome.status, JobStatus::Rejected);
        assert!(outcome.error.unwrap().contains("firmware-update"));
    }
}
