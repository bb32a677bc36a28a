//! Authenticated HTTP client for the cloud control plane.
//!
//! Registration authenticates with the fleet key; every other endpoint uses
//! the device key. Both the `Authorization: Bearer` and `X-Device-API-Key`
//! conventions are sent, since the control plane accepts either.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use vigil_domain::DeviceGraph;

use crate::error::CloudError;
use crate::jobs::{Job, JobOutcome};
use crate::report::CurrentStateReport;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationGrant {
    pub new_key: String,
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
    pub grace_period_ends: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatus {
    pub needs_rotation: bool,
    #[serde(default)]
    pub days_until_expiry: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    uuid: &'a str,
    device_api_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_name: Option<&'a str>,
    metadata: Value,
}

pub struct CloudApi {
    http: reqwest::Client,
    base_url: String,
    device_key: RwLock<String>,
}

impl CloudApi {
    pub fn new(base_url: impl Into<String>, device_key: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url,
            device_key: RwLock::new(device_key.into()),
        }
    }

    /// Swap the key used for device-authenticated requests, e.g. after a
    /// rotation grant or a completed key exchange.
    pub async fn set_device_key(&self, key: impl Into<String>) {
        *self.device_key.write().await = key.into();
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn device_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let key = self.device_key.read().await.clone();
        builder
            .bearer_auth(&key)
            .header("X-Device-API-Key", key)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, CloudError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(CloudError::Unauthorized);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(CloudError::Api { status: status.as_u16(), body })
    }

    // ── Provisioning ──────────────────────────────────────────────────────────

    /// Phase 1: announce the device under the fleet key.
    pub async fn register(
        &self,
        fleet_key: &str,
        uuid: &str,
        device_api_key: &str,
        device_name: Option<&str>,
        metadata: Value,
    ) -> Result<(), CloudError> {
        let resp = self
            .http
            .post(self.url("/device/register"))
            .bearer_auth(fleet_key)
            .json(&RegisterRequest { uuid, device_api_key, device_name, metadata })
            .send()
            .await?;
        match resp.status().as_u16() {
            200 | 201 => Ok(()),
            401 | 403 => Err(CloudError::InvalidFleetKey),
            409 => Err(CloudError::AlreadyRegistered),
            status => Err(CloudError::Api {
                status,
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }

    /// Phase 2: prove possession of the device key.
    pub async fn key_exchange(&self, uuid: &str, device_api_key: &str) -> Result<(), CloudError> {
        let resp = self
            .http
            .post(self.url(&format!("/device/{}/key-exchange", uuid)))
            .bearer_auth(device_api_key)
            .header("X-Device-API-Key", device_api_key)
            .json(&json!({ "uuid": uuid, "deviceApiKey": device_api_key }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    // ── Key rotation ──────────────────────────────────────────────────────────

    pub async fn rotate_key(&self, uuid: &str, reason: &str) -> Result<RotationGrant, CloudError> {
        let builder = self.http.post(self.url(&format!("/device/{}/rotate-key", uuid)));
        let resp = self
            .device_request(builder)
            .await
            .json(&json!({ "reason": reason }))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    pub async fn key_status(&self, uuid: &str) -> Result<KeyStatus, CloudError> {
        let builder = self.http.get(self.url(&format!("/device/{}/key-status", uuid)));
        let resp = self.device_request(builder).await.send().await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    // ── State ─────────────────────────────────────────────────────────────────

    /// Poll the target state. `None` means 304 / unchanged.
    pub async fn fetch_target(&self, uuid: &str) -> Result<Option<DeviceGraph>, CloudError> {
        let builder = self.http.get(self.url(&format!("/device/{}/state", uuid)));
        let resp = self.device_request(builder).await.send().await?;
        if resp.status().as_u16() == 304 {
            return Ok(None);
        }
        Ok(Some(Self::check(resp).await?.json().await?))
    }

    pub async fn report_state(&self, report: &CurrentStateReport) -> Result<(), CloudError> {
        let builder = self.http.patch(self.url("/device/state"));
        let resp = self.device_request(builder).await.json(report).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    // ── Logs ──────────────────────────────────────────────────────────────────

    /// Ship a pre-assembled NDJSON batch.
    pub async fn ship_logs(&self, uuid: &str, ndjson: String) -> Result<(), CloudError> {
        let builder = self.http.post(self.url(&format!("/device/{}/logs", uuid)));
        let resp = self
            .device_request(builder)
            .await
            .header("Content-Type", "application/x-ndjson")
            .body(ndjson)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    // ── Jobs ──────────────────────────────────────────────────────────────────

    pub async fn next_job(&self, uuid: &str) -> Result<Option<Job>, CloudError> {
        let builder = self.http.get(self.url(&format!("/devices/{}/jobs/next", uuid)));
        let resp = self.device_request(builder).await.send().await?;
        if resp.status().as_u16() == 204 {
            return Ok(None);
        }
        let value: Value = Self::check(resp).await?.json().await?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(value)?))
    }

    pub async fn ack_job(
        &self,
        uuid: &str,
        job_id: &str,
        outcome: &JobOutcome,
    ) -> Result<(), CloudError> {
        let builder = self
            .http
            .patch(self.url(&format!("/devices/{}/jobs/{}/status", uuid, job_id)));
        let resp = self.device_request(builder).await.json(outcome).send().await?;
        Self::check(resp).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn register_maps_conflict_to_already_registered() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/device/register"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "device-key");
        let err = api
            .register("fleet-key", "uuid-1", "device-key", None, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::AlreadyRegistered));
    }

    #[tokio::test]
    async fn register_maps_auth_failure_to_invalid_fleet_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/device/register"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "device-key");
        let err = api
            .register("bad-key", "uuid-1", "device-key", None, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::InvalidFleetKey));
    }

    #[tokio::test]
    async fn fetch_target_sends_both_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/device/uuid-1/state"))
            .and(header("Authorization", "Bearer device-key"))
            .and(header("X-Device-API-Key", "device-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "apps": {} })))
            .expect(1)
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "device-key");
        let graph = api.fetch_target("uuid-1").await.unwrap().unwrap();
        assert!(graph.apps.is_empty());
    }

    #[tokio::test]
    async fn fetch_target_treats_304_as_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/device/uuid-1/state"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "device-key");
        assert!(api.fetch_target("uuid-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unauthorized_surfaces_as_typed_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/device/uuid-1/state"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "stale-key");
        assert!(matches!(
            api.fetch_target("uuid-1").await.unwrap_err(),
            CloudError::Unauthorized
        ));
    }

    #[tokio::test]
    async fn rotated_key_is_used_on_subsequent_requests() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/device/uuid-1/state"))
            .and(header("Authorization", "Bearer new-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "apps": {} })))
            .expect(1)
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "old-key");
        api.set_device_key("new-key").await;
        api.fetch_target("uuid-1").await.unwrap();
    }

    #[tokio::test]
    async fn ship_logs_posts_ndjson_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/device/uuid-1/logs"))
            .and(header("Content-Type", "application/x-ndjson"))
            .and(body_string_contains("\"level\":\"info\""))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "device-key");
        api.ship_logs("uuid-1", "{\"level\":\"info\",\"message\":\"up\"}\n".into())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn next_job_handles_null_and_payload() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/devices/uuid-1/jobs/next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(null)))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "device-key");
        assert!(api.next_job("uuid-1").await.unwrap().is_none());

        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/devices/uuid-1/jobs/next"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "job-7",
                "kind": "echo",
                "payload": {"text": "hi"}
            })))
            .mount(&server)
            .await;
        let job = api.next_job("uuid-1").await.unwrap().unwrap();
        assert_eq!(job.id, "job-7");
        assert_eq!(job.kind, "echo");
    }
}
