use async_trait::async_trait;

use super::DeviceIdentity;
use crate::DomainError;

/// Persistence port for the device identity row.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn save(&self, identity: &DeviceIdentity) -> Result<(), DomainError>;

    async fn load(&self) -> Result<Option<DeviceIdentity>, DomainError>;

    /// Factory reset: forget identity and credentials.
    async fn delete(&self) -> Result<(), DomainError>;
}
