pub mod docker;
pub mod error;
pub mod mock;
pub mod runtime;

pub use docker::DockerRuntime;
pub use error::RuntimeError;
pub use mock::MockRuntime;
pub use runtime::{
    ContainerRuntime, ContainerSpec, ExecResult, ResourceLimits, RuntimeContainer, MANAGED_LABEL,
};
