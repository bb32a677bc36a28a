use thiserror::Error;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("device already registered")]
    AlreadyRegistered,

    #[error("fleet provisioning key rejected")]
    InvalidFleetKey,

    #[error("authentication exhausted: re-exchange and re-provisioning both failed")]
    AuthExhausted,

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("api error: status {status}: {body}")]
    Api { status: u16, body: String },

    #[error("store error: {0}")]
    Store(#[from] vigil_store::StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
