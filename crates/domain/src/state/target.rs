use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};

/// Versioned snapshot of everything the device should run, authored by the
/// cloud. The agent stores at most one of these at a time; the latest
/// accepted `version` is persisted across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    /// Applications keyed by app id. Keys are unique, ordering irrelevant.
    #[serde(default)]
    pub apps: BTreeMap<i64, App>,
    /// Device-level settings (free-form JSON values).
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    /// Monotonic version assigned by the cloud.
    #[serde(default)]
    pub version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub app_id: i64,
    pub app_name: String,
    #[serde(default)]
    pub services: Vec<Service>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub service_id: i64,
    pub service_name: String,
    /// Tag or digest reference. Must equal `config.image` after
    /// normalization; the cloud resolves floating tags before storing.
    pub image_name: String,
    #[serde(default)]
    pub config: ServiceConfig,
}

/// Recognized container configuration options. Absent collections are
/// represented as empty, never null, so current-vs-target comparison does
/// not produce spurious diffs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub image: String,
    /// `host:container` port mappings.
    pub ports: Vec<String>,
    pub environment: BTreeMap<String, String>,
    /// Bind/volume mount strings.
    pub volumes: Vec<String>,
    /// Bare network names; the runtime name is `"{appId}_{name}"`.
    pub networks: BTreeSet<String>,
    /// Restart policy string (`no`, `always`, `unless-stopped`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    pub command: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

impl TargetState {
    pub fn empty() -> Self {
        Self {
            apps: BTreeMap::new(),
            config: BTreeMap::new(),
            version: 0,
        }
    }

    /// Validate structural invariants before the state is accepted:
    /// `(appId, serviceId)` pairs globally unique, app ids consistent with
    /// their map key, and `imageName` consistent with `config.image`.
    pub fn validate(&self) -> Result<()> {
        let mut seen: HashSet<(i64, i64)> = HashSet::new();
        for (app_id, app) in &self.apps {
            if *app_id != app.app_id {
                return Err(DomainError::InvalidTargetState(format!(
                    "app key {} does not match appId {}",
                    app_id, app.app_id
                )));
            }
            for service in &app.services {
                if !seen.insert((app.app_id, service.service_id)) {
                    return Err(DomainError::InvalidTargetState(format!(
                        "duplicate service ({}, {})",
                        app.app_id, service.service_id
                    )));
                }
                service.validate()?;
            }
        }
        Ok(())
    }

    /// All `(appId, serviceId)` pairs in this snapshot.
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

    pub fn service(&self, app_id: i64, service_id: i64) -> Option<&Service> {
        self.apps
            .get(&app_id)
            .and_then(|app| app.services.iter().find(|s| s.service_id == service_id))
    }
}

impl Service {
    fn validate(&self) -> Result<()> {
        if self.image_name.is_empty() {
            return Err(DomainError::InvalidConfiguration(format!(
                "service {} has no image",
                self.service_id
            )));
        }
        if !self.config.image.is_empty() && self.config.image != self.image_name {
            return Err(DomainError::InvalidConfiguration(format!(
                "service {}: imageName '{}' conflicts with config.image '{}'",
                self.service_id, self.image_name, self.config.image
            )));
        }
        Ok(())
    }

    /// Copy with `config.image` filled in from `imageName` when the cloud
    /// omitted it.
    pub fn normalized(&self) -> Service {
        let mut service = self.clone();
        if service.config.image.is_empty() {
            service.config.image = service.image_name.clone();
        }
        service
    }
}

impl App {
    /// Union of network names referenced by this app's services.
    pub fn referenced_networks(&self) -> BTreeSet<String> {
        self.services
            .iter()
            .flat_map(|s| s.config.networks.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn service(id: i64, image: &str) -> Service {
        Service {
            service_id: id,
            service_name: format!("svc-{id}"),
            image_name: image.to_string(),
            config: ServiceConfig {
                image: image.to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_deserializes_cloud_shape() {
        let state: TargetState = serde_json::from_value(json!({
            "apps": {
                "1001": {
                    "appId": 1001,
                    "appName": "monitoring",
                    "services": [{
                        "serviceId": 1,
                        "serviceName": "nginx",
                        "imageName": "nginx@sha256:aaa",
                        "config": { "image": "nginx@sha256:aaa", "ports": ["80:80"] }
                    }]
                }
            },
            "config": { "sampling_hz": 10 },
            "version": 2
        }))
        .unwrap();

        assert_eq!(state.version, 2);
        let app = &state.apps[&1001];
        assert_eq!(app.app_name, "monitoring");
        assert_eq!(app.services[0].config.ports, vec!["80:80"]);
        // Absent collections come back empty, not null
        assert!(app.services[0].config.environment.is_empty());
        state.validate().unwrap();
    }

    #[test]
    fn test_duplicate_service_ids_rejected() {
        let mut state = TargetState::empty();
        state.apps.insert(
            1,
            App {
                app_id: 1,
                app_name: "a".into(),
                services: vec![service(7, "img:1"), service(7, "img:2")],
            },
        );
        assert!(matches!(
            state.validate(),
            Err(DomainError::InvalidTargetState(_))
        ));
    }

    #[test]
    fn test_image_name_conflict_rejected() {
        let mut svc = service(1, "nginx:1.25");
        svc.config.image = "nginx:1.26".to_string();
        let mut state = TargetState::empty();
        state.apps.insert(
            1,
            App {
                app_id: 1,
                app_name: "a".into(),
                services: vec![svc],
            },
        );
        assert!(state.validate().is_err());
    }

    #[test]
    fn test_normalized_fills_config_image() {
        let mut svc = service(1, "redis:7");
        svc.config.image.clear();
        assert_eq!(svc.normalized().config.image, "redis:7");
    }

    #[test]
    fn test_referenced_networks_is_union() {
        let mut a = service(1, "x:1");
        a.config.networks.insert("backend".into());
        let mut b = service(2, "y:1");
        b.config.networks.insert("backend".into());
        b.config.networks.insert("frontend".into());
        let app = App {
            app_id: 9,
            app_name: "app".into(),
            services: vec![a, b],
        };
        let nets: Vec<_> = app.referenced_networks().into_iter().collect();
        assert_eq!(nets, vec!["backend".to_string(), "frontend".to_string()]);
    }
}
