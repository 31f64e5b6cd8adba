use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_SHADOW_NAME: &str = "device-state";

/// Full shadow document as returned on `get/accepted`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShadowDocument {
    #[serde(default)]
    pub state: ShadowStateSection,
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShadowStateSection {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub desired: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub reported: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub delta: Map<String, Value>,
}

/// Intent-to-update published by the device (QoS 1). Only `reported` is
/// ever written from this side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowUpdate {
    pub state: UpdateStateSection,
    #[serde(rename = "clientToken")]
    pub client_token: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UpdateStateSection {
    pub reported: Map<String, Value>,
}

impl ShadowUpdate {
    pub fn reported(reported: Map<String, Value>, client_token: impl Into<String>) -> Self {
        Self {
            state: UpdateStateSection { reported },
            client_token: client_token.into(),
        }
    }
}

/// Cloud acknowledgment of an accepted update.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShadowAccepted {
    #[serde(default)]
    pub state: ShadowStateSection,
    #[serde(default)]
    pub version: i64,
    #[serde(rename = "clientToken", default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// Cloud rejection of an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowRejected {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "clientToken", default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
}

/// `desired \ reported`, published by the cloud when they diverge.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ShadowDelta {
    #[serde(default)]
    pub state: Map<String, Value>,
    #[serde(default)]
    pub version: i64,
}

/// Merge `patch` into `base`, last writer wins per field. Objects merge
/// recursively; any other value (including null) replaces. Used to
/// coalesce queued shadow updates while one is in flight.
pub fn merge_fields(base: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        match (base.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_fields(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_update_wire_shape() {
        let update = ShadowUpdate::reported(obj(json!({"fw": "1.2.0"})), "tok-1");
        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["state"]["reported"]["fw"], "1.2.0");
        assert_eq!(value["clientToken"], "tok-1");
    }

    #[test]
    fn test_delta_parses_with_version() {
        let delta: ShadowDelta = serde_json::from_value(json!({
            "state": { "mqtt": { "broker": "mqtts://new:8883" } },
            "version": 17
        }))
        .unwrap();
        assert_eq!(delta.version, 17);
        assert!(delta.state.contains_key("mqtt"));
    }

    #[test]
    fn test_merge_last_writer_wins() {
        let mut base = obj(json!({"logging": {"level": "info"}, "interval": 10}));
        merge_fields(&mut base, obj(json!({"interval": 30})));
        merge_fields(&mut base, obj(json!({"logging": {"level": "debug"}})));

        assert_eq!(base["interval"], 30);
        assert_eq!(base["logging"]["level"], "debug");
    }

    #[test]
    fn test_merge_recurses_objects_but_replaces_scalars() {
        let mut base = obj(json!({"mqtt": {"broker": "a", "port": 1883}}));
        merge_fields(&mut base, obj(json!({"mqtt": {"broker": "b"}})));

        assert_eq!(base["mqtt"]["broker"], "b");
        assert_eq!(base["mqtt"]["port"], 1883);

        merge_fields(&mut base, obj(json!({"mqtt": null})));
        assert_eq!(base["mqtt"], Value::Null);
    }
}
