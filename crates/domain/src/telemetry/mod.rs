//! Device telemetry shapes and the provider port. Reports include the
//! metrics block only every metrics interval; static fields are diffed
//! against the last transmitted value by the report loop.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    /// Aggregate CPU usage, percent.
    pub cpu_usage: f32,
    /// Bytes.
    pub memory_usage: u64,
    pub memory_total: u64,
    pub storage_usage: u64,
    pub storage_total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Seconds since boot.
    pub uptime: u64,
    /// Five heaviest processes by combined CPU and memory.
    pub top_processes: Vec<ProcessInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub cpu: f32,
    pub memory: u64,
}

/// Fields that rarely change; sent on the first report and afterwards
/// only when they differ from the last transmitted value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticFields {
    pub os_version: String,
    pub agent_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
}

#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn collect(&self) -> SystemMetrics;

    fn static_fields(&self) -> StaticFields;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_wire_keys_are_snake_case() {
        let metrics = SystemMetrics {
            cpu_usage: 12.5,
            memory_usage: 1024,
            memory_total: 2048,
            storage_usage: 10,
            storage_total: 100,
            temperature: None,
            uptime: 3600,
            top_processes: vec![ProcessInfo {
                name: "agent".into(),
                cpu: 1.0,
                memory: 64,
            }],
        };
        let value = serde_json::to_value(&metrics).unwrap();
        assert_eq!(value["cpu_usage"], 12.5);
        assert_eq!(value["memory_total"], 2048);
        assert!(value.get("temperature").is_none());
        assert_eq!(value["top_processes"][0]["name"], "agent");
    }
}
