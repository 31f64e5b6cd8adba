//! Shadow engine: desired/reported/delta synchronization over MQTT, with
//! a delta-driven apply pipeline that can reconfigure running subsystems
//! (broker migration included).

mod engine;
mod handlers;
mod transport;

pub use engine::{ShadowConfig, ShadowEngine, broker_settings, status_topic};
pub use handlers::{MqttDeltaSection, SensorPublishConfig};
pub use transport::ShadowTransport;
