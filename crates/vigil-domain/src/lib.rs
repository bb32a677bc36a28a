pub mod error;
pub mod probe;
pub mod resources;
pub mod sensor;
pub mod types;
pub mod volume;

pub use error::DomainError;
pub use probe::{Probe, ProbeHandler};
pub use resources::{ResourceSpec, Resources};
pub use sensor::{DeploymentStatus, SensorDevice, SensorProtocol};
pub use types::{
    App, AppId, DeviceConfig, DeviceGraph, FeatureFlags, PortMapping, RestartPolicy, Service,
    ServiceConfig, ServiceError, ServiceErrorKind, ServiceId, ServiceStatus,
};
pub use volume::VolumeRef;
