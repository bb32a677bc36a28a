pub mod adapter;
pub mod error;
pub mod manager;
pub mod virtual_adapter;

pub use adapter::{AdapterFactory, AdapterHealth, SensorAdapter, SensorPublisher, SensorReading};
pub use error::SensorError;
pub use manager::AdapterManager;
pub use virtual_adapter::VirtualAdapterFactory;
