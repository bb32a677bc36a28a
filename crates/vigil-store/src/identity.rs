use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The device's persistent identity and credentials.
///
/// `provisioning_api_key` is the fleet-level secret; it exists only until the
/// two-phase key exchange succeeds, and is deleted atomically with the flip
/// to `provisioned = true`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub uuid: String,
    pub device_api_key: String,
    pub provisioning_api_key: Option<String>,
    pub provisioned: bool,
    pub registered_at: Option<DateTime<Utc>>,
}

impl DeviceIdentity {
    /// A fresh, unprovisioned identity holding the given fleet key.
    pub fn generate(provisioning_api_key: Option<String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            device_api_key: generate_api_key(),
            provisioning_api_key,
            provisioned: false,
            registered_at: None,
        }
    }

    /// The secret used for outbound requests: the device key once
    /// provisioned, the fleet key before.
    pub fn active_key(&self) -> &str {
        if self.provisioned {
            &self.device_api_key
        } else {
            self.provisioning_api_key
                .as_deref()
                .unwrap_or(&self.device_api_key)
        }
    }
}

/// 256 bits from the OS RNG, base64 url-safe without padding.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
