use serde::{Deserialize, Serialize};

/// Identity and credentials of this device, assigned by the cloud at
/// provisioning. Persisted locally; mutated only by re-provisioning or a
/// shadow-driven broker migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub uuid: String,
    pub api_key: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_broker_url: String,
}

impl DeviceIdentity {
    /// Replace broker endpoint and credentials (shadow `mqtt` delta).
    pub fn with_broker(
        &self,
        broker_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            mqtt_broker_url: broker_url.into(),
            mqtt_username: username.into(),
            mqtt_password: password.into(),
            ..self.clone()
        }
    }
}
