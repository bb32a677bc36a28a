use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime connection failed: {0}")]
    ConnectionFailed(String),

    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("runtime api error: {0}")]
    Api(String),
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(e: bollard::errors::Error) -> Self {
        match &e {
            bollard::errors::Error::DockerResponseServerError { status_code: 404, message } => {
                RuntimeError::ContainerNotFound(message.clone())
            }
            bollard::errors::Error::DockerResponseServerError { status_code: 409, message } => {
                RuntimeError::Conflict(message.clone())
            }
            _ => RuntimeError::Api(e.to_string()),
        }
    }
}
