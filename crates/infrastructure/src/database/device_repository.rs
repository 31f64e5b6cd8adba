use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use sea_orm::{DatabaseConnection, EntityTrait, Set};

use domain::DomainError;
use domain::device::{DeviceIdentity, DeviceRepository};

use crate::database::entities::device;

pub struct SeaOrmDeviceRepository {
    db: DatabaseConnection,
}

impl SeaOrmDeviceRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    fn to_offset(dt: DateTime<Utc>) -> DateTime<FixedOffset> {
        dt.fixed_offset()
    }
}

#[async_trait]
impl DeviceRepository for SeaOrmDeviceRepository {
    async fn save(&self, identity: &DeviceIdentity) -> Result<(), DomainError> {
        let now = Self::to_offset(Utc::now());

        let active_model = device::ActiveModel {
            uuid: Set(identity.uuid.clone()),
            api_key: Set(identity.api_key.clone()),
            mqtt_username: Set(identity.mqtt_username.clone()),
            mqtt_password: Set(identity.mqtt_password.clone()),
            mqtt_broker_url: Set(identity.mqtt_broker_url.clone()),
            created_at: Set(Some(now)),
            updated_at: Set(Some(now)),
        };

        device::Entity::insert(active_model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(device::Column::Uuid)
                    .update_columns([
                        device::Column::ApiKey,
                        device::Column::MqttUsername,
                        device::Column::MqttPassword,
                        device::Column::MqttBrokerUrl,
                        device::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|e| DomainError::Storage(format!("Database error: {}", e)))?;

        Ok(())
    }

    async fn load(&self) -> Result<Option<DeviceIdentity>, DomainError> {
        let model = device::Entity::find()
            .one(&self.db)
            .await
            .map_err(|e| DomainError::Storage(format!("Database error: {}", e)))?;

        Ok(model.map(|m| DeviceIdentity {
            uuid: m.uuid,
            api_key: m.api_key,
            mqtt_username: m.mqtt_username,
            mqtt_password: m.mqtt_password,
            mqtt_broker_url: m.mqtt_broker_url,
        }))
    }

    async fn delete(&self) -> Result<(), DomainError> {
        device::Entity::delete_many()
            .exec(&self.db)
            .await
            .map_err(|e| DomainError::Storage(format!("Database error: {}", e)))?;
        Ok(())
    }
}
