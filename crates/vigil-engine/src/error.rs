use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] vigil_store::StoreError),

    #[error("runtime error: {0}")]
    Runtime(#[from] vigil_runtime::RuntimeError),

    #[error("internal error: {0}")]
    Internal(String),
}
