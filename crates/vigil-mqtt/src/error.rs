use thiserror::Error;

#[derive(Debug, Error)]
pub enum MqttError {
    #[error("mqtt client error: {0}")]
    Client(String),

    #[error("invalid mqtt url: {0}")]
    InvalidUrl(String),

    #[error("payload decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<rumqttc::ClientError> for MqttError {
    fn from(e: rumqttc::ClientError) -> Self {
        MqttError::Client(e.to_string())
    }
}
