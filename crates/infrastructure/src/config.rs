use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Agent settings, layered: built-in defaults, then an optional config
/// file, then environment variables (`CLOUD_API_ENDPOINT`,
/// `POLL_INTERVAL_MS`, ...).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AgentSettings {
    // Cloud HTTP
    pub cloud_api_endpoint: String,
    pub provisioning_api_key: Option<String>,
    pub device_name: Option<String>,
    pub device_type: String,

    // Loop cadences (milliseconds)
    pub poll_interval_ms: u64,
    pub report_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub reconciliation_interval_ms: u64,

    // Local log backend
    pub max_logs: usize,
    pub log_max_age: u64,
    pub enable_file_logging: bool,
    pub log_dir: String,
    pub max_log_file_size: u64,

    // Cloud log backend
    pub enable_cloud_logging: bool,
    pub log_compression: bool,

    // MQTT overrides (provisioned credentials used when unset)
    pub mqtt_broker: Option<String>,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_log_qos: u8,

    // Shadow engine
    pub enable_shadow: bool,
    pub shadow_name: String,
    pub shadow_sync_on_delta: bool,
    pub shadow_publish_interval: u64,

    // Agent-internal
    pub log_level: String,
    pub device_api_port: u16,
    pub data_dir: String,
}

impl AgentSettings {
    pub fn load(config_dir: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("cloud_api_endpoint", "http://localhost:3000")?
            .set_default("device_type", "edge-gateway")?
            .set_default("poll_interval_ms", 10_000u64)?
            .set_default("report_interval_ms", 10_000u64)?
            .set_default("metrics_interval_ms", 300_000u64)?
            .set_default("reconciliation_interval_ms", 30_000u64)?
            .set_default("max_logs", 10_000u64)?
            .set_default("log_max_age", 86_400_000u64)?
            .set_default("enable_file_logging", false)?
            .set_default("log_dir", "data/logs")?
            .set_default("max_log_file_size", 10u64 * 1024 * 1024)?
            .set_default("enable_cloud_logging", true)?
            .set_default("log_compression", true)?
            .set_default("mqtt_log_qos", 1u64)?
            .set_default("enable_shadow", true)?
            .set_default("shadow_name", "device-state")?
            .set_default("shadow_sync_on_delta", true)?
            .set_default("shadow_publish_interval", 60_000u64)?
            .set_default("log_level", "info")?
            .set_default("device_api_port", 48_484u64)?
            .set_default("data_dir", "data")?
            // Optional file layer, e.g. config/default.toml
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            // Environment variables win (CLOUD_API_ENDPOINT, MAX_LOGS, ...)
            .add_source(Environment::default().try_parsing(true))
            .build()?;

        s.try_deserialize()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn reconciliation_interval(&self) -> Duration {
        Duration::from_millis(self.reconciliation_interval_ms)
    }

    pub fn shadow_publish_interval(&self) -> Duration {
        Duration::from_millis(self.shadow_publish_interval)
    }
}
