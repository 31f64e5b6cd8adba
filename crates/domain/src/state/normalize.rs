//! Comparison rules between a target service configuration and the
//! configuration extracted from a running container. The runtime injects
//! environment variables, labels and defaults of its own; comparing those
//! naively restarts containers for cosmetic reasons.

use super::target::ServiceConfig;

/// Deduplicate and sort port mappings so ordering and repetition never
/// count as a change.
pub fn normalize_ports(ports: &[String]) -> Vec<String> {
    let mut out: Vec<String> = ports.to_vec();
    out.sort();
    out.dedup();
    out
}

/// Deduplicate and sort mount strings.
pub fn normalize_volumes(volumes: &[String]) -> Vec<String> {
    let mut out: Vec<String> = volumes.to_vec();
    out.sort();
    out.dedup();
    out
}

/// Whether a running service must be recreated to match the target.
///
/// - `image` compares byte-for-byte: a digest-pinned reference differs
///   from a tag reference even when the underlying image is identical.
/// - `environment` compares only keys the target explicitly sets;
///   runtime-injected vars (PATH, HOSTNAME, ...) are ignored.
/// - `labels` likewise compare only target-declared keys, since the agent
///   injects ownership labels of its own.
/// - collections compare normalized, so empty-vs-absent and ordering are
///   never a diff.
pub fn service_config_changed(target: &ServiceConfig, current: &ServiceConfig) -> bool {
    if target.image != current.image {
        return true;
    }
    if normalize_ports(&target.ports) != normalize_ports(&current.ports) {
        return true;
    }
    if normalize_volumes(&target.volumes) != normalize_volumes(&current.volumes) {
        return true;
    }
    if target.networks != current.networks {
        return true;
    }
    for (key, value) in &target.environment {
        if current.environment.get(key) != Some(value) {
            return true;
        }
    }
    for (key, value) in &target.labels {
        if current.labels.get(key) != Some(value) {
            return true;
        }
    }
    if !target.command.is_empty() && target.command != current.command {
        return true;
    }
    if let Some(restart) = &target.restart {
        if current.restart.as_deref() != Some(restart.as_str()) {
            return true;
        }
    }
    false
}
