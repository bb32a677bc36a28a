//! A synthetic in-process adapter. Produces deterministic readings from its
//! `connection` object; used by tests and demo configurations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use vigil_domain::{SensorDevice, SensorProtocol};

use crate::adapter::{AdapterFactory, SensorAdapter};
use crate::error::SensorError;

pub struct VirtualAdapterFactory {
    creates: Arc<AtomicU64>,
}

impl Default for VirtualAdapterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualAdapterFactory {
    pub fn new() -> Self {
        Self { creates: Arc::new(AtomicU64::new(0)) }
    }

    /// How many adapters this factory has built. Lets tests observe
    /// stop-then-start on config changes.
    pub fn create_count(&self) -> u64 {
        self.creates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdapterFactory for VirtualAdapterFactory {
    fn protocol(&self) -> SensorProtocol {
        SensorProtocol::Virtual
    }

    fn create(&self, device: &SensorDevice) -> Result<Box<dyn SensorAdapter>, SensorError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(VirtualAdapter {
            name: device.name.clone(),
            connection: device.connection.clone(),
            polls: 0,
        }))
    }
}

struct VirtualAdapter {
    name: String,
    connection: Value,
    polls: u64,
}

impl VirtualAdapter {
    fn flag(&self, key: &str) -> bool {
        self.connection.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

#[async_trait]
impl SensorAdapter for VirtualAdapter {
    async fn connect(&mut self) -> Result<(), SensorError> {
        if self.flag("fail_connect") {
            return Err(SensorError::ConnectFailed(format!(
                "virtual device {} refused connection",
                self.name
            )));
        }
        Ok(())
    }

    async fn poll(&mut self) -> Result<Value, SensorError> {
        if self.flag("fail_poll") {
            return Err(SensorError::PollFailed(format!(
                "virtual device {} poll error",
                self.name
            )));
        }
        self.polls += 1;
        Ok(json!({
            "sequence": self.polls,
            "value": self.connection.get("value").cloned().unwrap_or(json!(0)),
        }))
    }

    async fn disconnect(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(connection: Value) -> SensorDevice {
        serde_json::from_value(json!({
            "name": "virt-1",
            "protocol": "virtual",
            "connection": connection,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn polls_produce_sequenced_readings() {
        let factory = VirtualAdapterFactory::new();
        let mut adapter = factory.create(&device(json!({"value": 21.5}))).unwrap();
        adapter.connect().await.unwrap();
        let first = adapter.poll().await.unwrap();
        let second = adapter.poll().await.unwrap();
        assert_eq!(first["sequence"], 1);
        assert_eq!(second["sequence"], 2);
        assert_eq!(first["value"], 21.5);
    }

    #[tokio::test]
    async fn scripted_connect_failure() {
        let factory = VirtualAdapterFactory::new();
        let mut adapter = factory.create(&device(json!({"fail_connect": true}))).unwrap();
        assert!(adapter.connect().await.is_err());
    }
}
