use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set};

use domain::DomainError;
use domain::state::{CurrentState, StateRepository, TargetState};

use crate::database::entities::{current_state_cache, target_state_snapshots};

pub struct SeaOrmStateRepository {
    db: DatabaseConnection,
}

impl SeaOrmStateRepository {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StateRepository for SeaOrmStateRepository {
    async fn save_target<'a>(
        &'a self,
        uuid: &'a str,
        target: &'a TargetState,
        etag: Option<&'a str>,
    ) -> Result<(), DomainError> {
        let payload = serde_json::to_value(target)
            .map_err(|e| DomainError::Storage(format!("Serialize target: {}", e)))?;

        let active_model = target_state_snapshots::ActiveModel {
            device_uuid: Set(uuid.to_string()),
            version: Set(target.version),
            payload: Set(payload),
            etag: Set(etag.map(String::from)),
            created_at: Set(Some(Utc::now().fixed_offset())),
        };

        target_state_snapshots::Entity::insert(active_model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::columns([
                    target_state_snapshots::Column::DeviceUuid,
                    target_state_snapshots::Column::Version,
                ])
                .update_columns([
                    target_state_snapshots::Column::Payload,
                    target_state_snapshots::Column::Etag,
                ])
                .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|e| DomainError::Storage(format!("Database error: {}", e)))?;

        Ok(())
    }

    async fn load_target(
        &self,
        uuid: &str,
    ) -> Result<Option<(TargetState, Option<String>)>, DomainError> {
        let model = target_state_snapshots::Entity::find()
            .filter(target_state_snapshots::Column::DeviceUuid.eq(uuid))
            .order_by_desc(target_state_snapshots::Column::Version)
            .one(&self.db)
            .await
            .map_err(|e| DomainError::Storage(format!("Database error: {}", e)))?;

        match model {
            Some(m) => {
                let target: TargetState = serde_json::from_value(m.payload)
                    .map_err(|e| DomainError::Storage(format!("Corrupt target snapshot: {}", e)))?;
                Ok(Some((target, m.etag)))
            }
            None => Ok(None),
        }
    }

    async fn save_current(&self, uuid: &str, current: &CurrentState) -> Result<(), DomainError> {
        let payload = serde_json::to_value(current)
            .map_err(|e| DomainError::Storage(format!("Serialize current: {}", e)))?;

        let active_model = current_state_cache::ActiveModel {
            device_uuid: Set(uuid.to_string()),
            payload: Set(payload),
            updated_at: Set(Some(Utc::now().fixed_offset())),
        };

        current_state_cache::Entity::insert(active_model)
            .on_conflict(
                sea_orm::sea_query::OnConflict::column(current_state_cache::Column::DeviceUuid)
                    .update_columns([
                        current_state_cache::Column::Payload,
                        current_state_cache::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await
            .map_err(|e| DomainError::Storage(format!("Database error: {}", e)))?;

        Ok(())
    }

    async fn load_current(&self, uuid: &str) -> Result<Option<CurrentState>, DomainError> {
        let model = current_state_cache::Entity::find_by_id(uuid.to_string())
            .one(&self.db)
            .await
            .map_err(|e| DomainError::Storage(format!("Database error: {}", e)))?;

        match model {
            Some(m) => {
                let current: CurrentState = serde_json::from_value(m.payload)
                    .map_err(|e| DomainError::Storage(format!("Corrupt current cache: {}", e)))?;
                Ok(Some(current))
            }
            None => Ok(None),
        }
    }
}
