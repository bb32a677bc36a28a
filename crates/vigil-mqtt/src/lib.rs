pub mod bus;
pub mod error;
pub mod topic;

pub use bus::{InboundMessage, MqttBus, MqttSettings, RotationNotice};
pub use error::MqttError;
pub use topic::{jobs_filter, log_topic, rotation_topic, sensor_topic, topic_matches};
