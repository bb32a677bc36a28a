//! Two-phase provisioning and the 401 recovery path.
//!
//! The fleet key's blast radius is the fleet and its useful life is one
//! successful registration; the device key is scoped to one device. The
//! handshake swaps the former for the latter and deletes the fleet key
//! atomically with the provisioned flag.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use vigil_store::{DeviceIdentity, StateStore};

use crate::client::CloudApi;
use crate::error::CloudError;

/// Ensure an identity exists on disk, generating uuid and device key before
/// first contact. An already-stored identity wins over `fleet_key`.
pub async fn ensure_identity(
    store: &Arc<dyn StateStore>,
    fleet_key: Option<String>,
) -> Result<DeviceIdentity, CloudError> {
    if let Some(identity) = store.load_identity().await? {
        return Ok(identity);
    }
    let identity = DeviceIdentity::generate(fleet_key);
    store.save_identity(&identity).await?;
    info!(uuid = %identity.uuid, "generated device identity");
    Ok(identity)
}

/// Run the two-phase handshake if the device is not yet provisioned.
/// Idempotent: an `AlreadyRegistered` phase-1 answer proceeds to phase 2.
pub async fn provision(
    store: &Arc<dyn StateStore>,
    api: &CloudApi,
    device_name: Option<&str>,
) -> Result<DeviceIdentity, CloudError> {
    let identity = store
        .load_identity()
        .await?
        .ok_or(CloudError::AuthExhausted)?;
    if identity.provisioned {
        api.set_device_key(identity.device_api_key.clone()).await;
        return Ok(identity);
    }

    let fleet_key = identity
        .provisioning_api_key
        .clone()
        .ok_or(CloudError::InvalidFleetKey)?;

    // Phase 1: register under the fleet key.
    match api
        .register(
            &fleet_key,
            &identity.uuid,
            &identity.device_api_key,
            device_name,
            json!({ "agent": "vigil" }),
        )
        .await
    {
        Ok(()) => {}
        // A retried handshake after a crash between the phases.
        Err(CloudError::AlreadyRegistered) => {
            info!(uuid = %identity.uuid, "device already registered, continuing to key exchange");
        }
        Err(e) => return Err(e),
    }

    // Phase 2: prove the device key.
    api.key_exchange(&identity.uuid, &identity.device_api_key).await?;

    // The flag flip and fleet-key deletion are one write transaction.
    let identity = store.mark_provisioned(&identity.uuid).await?;
    api.set_device_key(identity.device_api_key.clone()).await;
    info!(uuid = %identity.uuid, "device provisioned");
    Ok(identity)
}

/// 401 discipline: one re-exchange attempt; if that fails, fall back to full
/// re-provisioning under the stored fleet key, else surface a fatal error.
pub async fn recover_unauthorized(
    store: &Arc<dyn StateStore>,
    api: &CloudApi,
) -> Result<DeviceIdentity, CloudError> {
    let identity = store
        .load_identity()
        .await?
        .ok_or(CloudError::AuthExhausted)?;

    match api.key_exchange(&identity.uuid, &identity.device_api_key).await {
        Ok(()) => {
            api.set_device_key(identity.device_api_key.clone()).await;
            info!(uuid = %identity.uuid, "key re-exchange succeeded");
            return Ok(identity);
        }
        Err(e) => {
            warn!(uuid = %identity.uuid, error = %e, "key re-exchange failed");
        }
    }

    if identity.provisioning_api_key.is_none() {
        return Err(CloudError::AuthExhausted);
    }

    // Demote and run the handshake again with the retained fleet key.
    let mut demoted = identity;
    demoted.provisioned = false;
    store.save_identity(&demoted).await?;
    provision(store, api, None).await
}

/// Apply a rotation grant: persist the new key and re-key the client. The
/// old key stays valid on the cloud side until the grace period ends, so a
/// crashed write here is recoverable by a later re-exchange.
pub async fn apply_rotation(
    store: &Arc<dyn StateStore>,
    api: &CloudApi,
    new_key: String,
) -> Result<(), CloudError> {
    let mut identity = store
        .load_identity()
        .await?
        .ok_or(CloudError::AuthExhausted)?;
    identity.device_api_key = new_key.clone();
    store.save_identity(&identity).await?;
    api.set_device_key(new_key).await;
    info!(uuid = %identity.uuid, "device api key rotated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_store::MemoryStore;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store_with_fleet_key() -> Arc<dyn StateStore> {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        ensure_identity(&store, Some("fleet-secret".into())).await.unwrap();
        store
    }

    #[tokio::test]
    async fn two_phase_handshake_provisions_and_drops_fleet_key() {
        let server = MockServer::start().await;
        let store = store_with_fleet_key().await;
        let identity = store.load_identity().await.unwrap().unwrap();

        Mock::given(method("POST"))
            .and(path("/device/register"))
            .and(header("Authorization", "Bearer fleet-secret"))
            .and(body_string_contains(&identity.uuid))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({ "id": 1, "uuid": identity.uuid }),
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/device/{}/key-exchange", identity.uuid)))
            .and(header(
                "Authorization",
                format!("Bearer {}", identity.device_api_key).as_str(),
            ))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "ok" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "");
        let provisioned = provision(&store, &api, Some("edge-42")).await.unwrap();
        assert!(provisioned.provisioned);
        assert!(provisioned.provisioning_api_key.is_none());

        // On disk too.
        let loaded = store.load_identity().await.unwrap().unwrap();
        assert!(loaded.provisioned);
        assert!(loaded.provisioning_api_key.is_none());
    }

    #[tokio::test]
    async fn already_registered_still_completes_phase_two() {
        let server = MockServer::start().await;
        let store = store_with_fleet_key().await;
        let identity = store.load_identity().await.unwrap().unwrap();

        Mock::given(method("POST"))
            .and(path("/device/register"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(format!("/device/{}/key-exchange", identity.uuid)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "ok" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "");
        assert!(provision(&store, &api, None).await.unwrap().provisioned);
    }

    #[tokio::test]
    async fn invalid_fleet_key_fails_provisioning() {
        let server = MockServer::start().await;
        let store = store_with_fleet_key().await;

        Mock::given(method("POST"))
            .and(path("/device/register"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "");
        assert!(matches!(
            provision(&store, &api, None).await.unwrap_err(),
            CloudError::InvalidFleetKey
        ));
        assert!(!store.load_identity().await.unwrap().unwrap().provisioned);
    }

    #[tokio::test]
    async fn recover_unauthorized_reexchanges_once() {
        let server = MockServer::start().await;
        let store = store_with_fleet_key().await;
        let identity = store.load_identity().await.unwrap().unwrap();

        Mock::given(method("POST"))
            .and(path(format!("/device/{}/key-exchange", identity.uuid)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "status": "ok" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "stale");
        recover_unauthorized(&store, &api).await.unwrap();
    }

    #[tokio::test]
    async fn recovery_without_fleet_key_is_fatal() {
        let server = MockServer::start().await;
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        ensure_identity(&store, None).await.unwrap();

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let api = CloudApi::new(server.uri(), "stale");
        assert!(matches!(
            recover_unauthorized(&store, &api).await.unwrap_err(),
            CloudError::AuthExhausted
        ));
    }

    #[tokio::test]
    async fn rotation_persists_and_rekeys() {
        let server = MockServer::start().await;
        let store = store_with_fleet_key().await;

        apply_rotation(&store, &CloudApi::new(server.uri(), "old"), "brand-new-key".into())
            .await
            .unwrap();
        assert_eq!(
            store.load_identity().await.unwrap().unwrap().device_api_key,
            "brand-new-key"
        );
    }
}
