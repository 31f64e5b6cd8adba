use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};
use uuid::Uuid;

use domain::cloud::{CloudApi, ProvisioningRequest};
use domain::device::{DeviceIdentity, DeviceRepository};
use infrastructure::config::AgentSettings;

/// Load the persisted identity, or register against the cloud on first
/// boot. Environment MQTT overrides win over provisioned credentials in
/// both cases.
pub async fn ensure_identity(
    settings: &AgentSettings,
    devices: &Arc<dyn DeviceRepository>,
    cloud: &Arc<dyn CloudApi>,
) -> Result<DeviceIdentity> {
    if let Some(identity) = devices
        .load()
        .await
        .context("Failed to read device identity")?
    {
        info!(uuid = %identity.uuid, "Loaded persisted device identity");
        return Ok(apply_overrides(identity, settings));
    }

    let identity = register(settings, devices, cloud, Uuid::new_v4().to_string()).await?;
    Ok(apply_overrides(identity, settings))
}

/// One re-provisioning attempt for an existing uuid (401 recovery). The
/// uuid is stable; only credentials are refreshed.
pub async fn reprovision(
    settings: &AgentSettings,
    devices: &Arc<dyn DeviceRepository>,
    cloud: &Arc<dyn CloudApi>,
    uuid: String,
) -> Result<DeviceIdentity> {
    warn!(uuid = %uuid, "Re-provisioning device credentials");
    let identity = register(settings, devices, cloud, uuid).await?;
    Ok(apply_overrides(identity, settings))
}

async fn register(
    settings: &AgentSettings,
    devices: &Arc<dyn DeviceRepository>,
    cloud: &Arc<dyn CloudApi>,
    uuid: String,
) -> Result<DeviceIdentity> {
    let provisioning_key = settings
        .provisioning_api_key
        .clone()
        .ok_or_else(|| anyhow!("PROVISIONING_API_KEY is not set and no identity is stored"))?;

    let device_name = settings
        .device_name
        .clone()
        .or_else(host_name)
        .unwrap_or_else(|| format!("device-{}", &uuid[..8]));

    let request = ProvisioningRequest {
        uuid: uuid.clone(),
        device_name,
        device_type: settings.device_type.clone(),
        provisioning_key,
    };

    info!(uuid = %uuid, "📡 Registering device with the cloud");
    let response = cloud
        .register(&request)
        .await
        .context("Device registration failed")?;
    if let Some(version) = response.initial_target_version {
        info!(version, "Cloud holds an initial target for this device");
    }

    let identity = DeviceIdentity {
        uuid,
        api_key: response.api_key,
        mqtt_username: response.mqtt_username,
        mqtt_password: response.mqtt_password,
        mqtt_broker_url: response.mqtt_broker_url,
    };
    devices
        .save(&identity)
        .await
        .context("Failed to persist device identity")?;
    info!(uuid = %identity.uuid, "✅ Device registered");
    Ok(identity)
}

fn apply_overrides(mut identity: DeviceIdentity, settings: &AgentSettings) -> DeviceIdentity {
    if let Some(broker) = &settings.mqtt_broker {
        identity.mqtt_broker_url = broker.clone();
    }
    if let Some(username) = &settings.mqtt_username {
        identity.mqtt_username = username.clone();
    }
    if let Some(password) = &settings.mqtt_password {
        identity.mqtt_password = password.clone();
    }
    identity
}

fn host_name() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}
