use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::target::ServiceConfig;

/// Container states the runtime reports, always lowercased.
pub mod status {
    pub const RUNNING: &str = "running";
    pub const CREATED: &str = "created";
    pub const EXITED: &str = "exited";
    pub const PAUSED: &str = "paused";
    /// Synthesized by the reconciler when a service exceeded its
    /// consecutive-failure cap (e.g. an unpullable image).
    pub const DEGRADED: &str = "degraded";
}

/// What the device actually runs, observed from the runtime. Same shape as
/// the target minus `version`, plus per-service runtime fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CurrentState {
    #[serde(default)]
    pub apps: BTreeMap<i64, CurrentApp>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentApp {
    pub app_id: i64,
    pub app_name: String,
    #[serde(default)]
    pub services: Vec<CurrentService>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentService {
    pub service_id: i64,
    pub service_name: String,
    pub image_name: String,
    #[serde(default)]
    pub config: ServiceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

impl CurrentState {
    pub fn service(&self, app_id: i64, service_id: i64) -> Option<&CurrentService> {
        self.apps
            .get(&app_id)
            .and_then(|app| app.services.iter().find(|s| s.service_id == service_id))
    }

    pub fn service_mut(&mut self, app_id: i64, service_id: i64) -> Option<&mut CurrentService> {
        self.apps
            .get_mut(&app_id)
            .and_then(|app| app.services.iter_mut().find(|s| s.service_id == service_id))
    }

    /// All `(appId, serviceId)` pairs currently materialized.
    pub fn service_keys(&self) -> Vec<(i64, i64)> {
        self.apps
            .values()
            .flat_map(|app| {
                app.services
                    .iter()
                    .map(move |s| (app.app_id, s.service_id))
            })
            .collect()
    }
}

impl CurrentService {
    pub fn is_running(&self) -> bool {
        self.status == status::RUNNING
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_pair() {
        let mut state = CurrentState::default();
        state.apps.insert(
            2,
            CurrentApp {
                app_id: 2,
                app_name: "edge".into(),
                services: vec![CurrentService {
                    service_id: 5,
                    service_name: "broker".into(),
                    image_name: "eclipse-mosquitto:2".into(),
                    config: ServiceConfig::default(),
                    container_id: Some("abc123".into()),
                    status: status::RUNNING.into(),
                    created_at: None,
                    started_at: None,
                }],
            },
        );

        assert!(state.service(2, 5).unwrap().is_running());
        assert!(state.service(2, 6).is_none());
        assert_eq!(state.service_keys(), vec![(2, 5)]);
    }
}
