use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("no adapter registered for protocol: {0}")]
    UnknownProtocol(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("poll failed: {0}")]
    PollFailed(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("invalid sensor configuration: {0}")]
    InvalidConfig(String),
}
