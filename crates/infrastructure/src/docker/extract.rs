//! Pure extraction helpers: from Docker API shapes to the normalized
//! domain view.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bollard::models::PortBinding;

use super::labels;

/// Identity of a managed container, parsed from its labels.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagedIdentity {
    pub app_id: i64,
    pub app_name: String,
    pub service_id: i64,
    pub service_name: String,
}

pub fn managed_identity(labels: &HashMap<String, String>) -> Option<ManagedIdentity> {
    if labels.get(labels::MANAGED).map(String::as_str) != Some("true") {
        return None;
    }
    Some(ManagedIdentity {
        app_id: labels.get(labels::APP_ID)?.parse().ok()?,
        app_name: labels.get(labels::APP_NAME)?.clone(),
        service_id: labels.get(labels::SERVICE_ID)?.parse().ok()?,
        service_name: labels.get(labels::SERVICE_NAME)?.clone(),
    })
}

/// `host:container` strings from the runtime port map. Only mappings with
/// both a public and a private port are kept; duplicates collapse.
pub fn ports_from_map(
    port_map: Option<&HashMap<String, Option<Vec<PortBinding>>>>,
) -> Vec<String> {
    let mut out = BTreeSet::new();
    if let Some(map) = port_map {
        for (private, bindings) in map {
            let private_port = private.split('/').next().unwrap_or(private);
            if private_port.is_empty() {
                continue;
            }
            for binding in bindings.iter().flatten() {
                if let Some(host_port) = binding.host_port.as_deref() {
                    if !host_port.is_empty() {
                        out.insert(format!("{host_port}:{private_port}"));
                    }
                }
            }
        }
    }
    out.into_iter().collect()
}

/// `KEY=VALUE` entries into a mapping. Malformed entries are dropped.
pub fn env_from_list(env: Option<&Vec<String>>) -> BTreeMap<String, String> {
    env.into_iter()
        .flatten()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect()
}

/// Bare network names this app's container is attached to: runtime
/// attachments named `"{app_id}_{name}"`, prefix stripped. Default-bridge
/// and foreign networks are not part of the managed view.
pub fn networks_from_attachments<'a>(
    attachments: impl Iterator<Item = &'a String>,
    app_id: i64,
) -> BTreeSet<String> {
    let prefix = format!("{app_id}_");
    attachments
        .filter_map(|name| name.strip_prefix(&prefix))
        .map(String::from)
        .collect()
}

/// A target `host:container[/proto]` mapping split for container creation.
#[derive(Debug, Clone, PartialEq)]
pub struct PortSpec {
    pub host_port: String,
    pub container_port: String,
    pub protocol: String,
}

pub fn parse_port_spec(spec: &str) -> Option<PortSpec> {
    let (mapping, protocol) = match spec.split_once('/') {
        Some((mapping, proto)) => (mapping, proto),
        None => (spec, "tcp"),
    };
    let (host, container) = mapping.split_once(':')?;
    if host.is_empty() || container.is_empty() {
        return None;
    }
    Some(PortSpec {
        host_port: host.to_string(),
        container_port: container.to_string(),
        protocol: protocol.to_string(),
    })
}

pub fn normalize_status(status: Option<&str>) -> String {
    status.unwrap_or("unknown").to_ascii_lowercase()
}
