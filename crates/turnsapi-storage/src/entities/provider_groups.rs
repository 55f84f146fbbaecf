use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_groups")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub group_id: String,
    pub name: String,
    pub provider_type: String,
    pub base_url: String,
    pub enabled: bool,
    pub timeout_seconds: i32,
    pub max_retries: i32,
    pub rotation_strategy: String,
    pub models: Json,
    pub headers: Json,
    pub request_params: Option<Json>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub keys: HasMany<super::provider_api_keys::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
