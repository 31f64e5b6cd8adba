//! Port to the cloud control plane (device-side HTTP calls only).

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{CurrentApp, TargetState};
use crate::telemetry::SystemMetrics;

#[derive(Error, Debug, Clone)]
pub enum CloudError {
    /// 401: credentials no longer valid, triggers re-provisioning.
    #[error("Unauthorized")]
    Unauthorized,

    /// Network failures and 5xx responses; retried with backoff.
    #[error("Transient cloud error: {0}")]
    Transient(String),

    #[error("Cloud returned {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Malformed cloud response: {0}")]
    Malformed(String),
}

impl CloudError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Outcome of a conditional target-state fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum TargetFetch {
    /// 304: the stored ETag still matches; no body.
    NotModified,
    Fetched { state: TargetState, etag: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningRequest {
    pub uuid: String,
    pub device_name: String,
    pub device_type: String,
    pub provisioning_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningResponse {
    pub api_key: String,
    pub mqtt_broker_url: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_target_version: Option<i64>,
}

/// Body of `PATCH /device/state` (wrapped as `{uuid: report}` on the
/// wire). Metrics are present only on metrics cycles; static fields only
/// when changed since the last transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceReport {
    pub apps: BTreeMap<i64, CurrentApp>,
    pub config: BTreeMap<String, serde_json::Value>,
    pub is_online: bool,
    #[serde(flatten)]
    pub metrics: Option<SystemMetrics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_ip: Option<String>,
}

#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn register(
        &self,
        request: &ProvisioningRequest,
    ) -> Result<ProvisioningResponse, CloudError>;

    /// `GET /device/{uuid}/state` with `If-None-Match` when an ETag is
    /// known.
    async fn fetch_target_state(
        &self,
        uuid: &str,
        etag: Option<&str>,
    ) -> Result<TargetFetch, CloudError>;

    /// `PATCH /device/state`.
    async fn patch_device_state(&self, uuid: &str, report: &DeviceReport)
    -> Result<(), CloudError>;

    /// `POST /device/{uuid}/logs` with an NDJSON body.
    async fn upload_logs(&self, uuid: &str, ndjson: Vec<u8>) -> Result<(), CloudError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_omits_absent_sections() {
        let report = DeviceReport {
            apps: BTreeMap::new(),
            config: BTreeMap::new(),
            is_online: true,
            metrics: None,
            os_version: None,
            agent_version: None,
            local_ip: None,
        };
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["is_online"], true);
        assert!(value.get("cpu_usage").is_none());
        assert!(value.get("os_version").is_none());
    }

    #[test]
    fn test_provisioning_wire_shape() {
        let request = ProvisioningRequest {
            uuid: "dev-1".into(),
            device_name: "bench".into(),
            device_type: "gateway".into(),
            provisioning_key: "pk_test_1".into(),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["provisioningKey"], "pk_test_1");
        assert_eq!(value["deviceType"], "gateway");
    }
}
