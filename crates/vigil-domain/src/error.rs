use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("invalid port mapping: {0}")]
    InvalidPortMapping(String),

    #[error("invalid volume reference: {0}")]
    InvalidVolumeRef(String),

    #[error("invalid cpu quantity: {0}")]
    InvalidCpuQuantity(String),

    #[error("invalid memory quantity: {0}")]
    InvalidMemoryQuantity(String),

    #[error("invalid probe: {0}")]
    InvalidProbe(String),
}
