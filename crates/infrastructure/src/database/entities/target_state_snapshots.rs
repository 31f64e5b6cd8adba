use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "target_state_snapshots")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub device_uuid: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub version: i64,
    pub payload: Json,
    pub etag: Option<String>,
    pub created_at: Option<DateTimeWithTimeZone>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
