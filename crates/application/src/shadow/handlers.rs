use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The `mqtt` delta section: broker migration order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MqttDeltaSection {
    pub broker: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl MqttDeltaSection {
    pub fn parse(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Sensor publishing configuration, adjusted by the `sensors` delta
/// section. Partial deltas merge over the previous values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorPublishConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    #[serde(default)]
    pub thresholds: Map<String, Value>,
}

impl Default for SensorPublishConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            thresholds: Map::new(),
        }
    }
}

impl SensorPublishConfig {
    /// Apply a partial section: only present fields change.
    pub fn apply(&mut self, value: &Value) {
        let Some(section) = value.as_object() else {
            return;
        };
        if let Some(enabled) = section.get("enabled").and_then(Value::as_bool) {
            self.enabled = enabled;
        }
        if let Some(interval) = section.get("interval_ms").and_then(Value::as_u64) {
            self.interval_ms = interval;
        }
        if let Some(Value::Object(thresholds)) = section.get("thresholds") {
            for (key, threshold) in thresholds {
                self.thresholds.insert(key.clone(), threshold.clone());
            }
        }
    }
}
