//! Log sinks. Each backend is independent: a failure in one never
//! affects the others, and emission from the capture path never blocks.

mod cloud_backend;
mod local_backend;
mod mqtt_backend;

pub use cloud_backend::{CloudLogBackend, CloudLogConfig};
pub use local_backend::{FilePersistenceConfig, LocalLogBackend, LocalLogConfig};
pub use mqtt_backend::{MqttLogBackend, MqttLogConfig, log_topic};
