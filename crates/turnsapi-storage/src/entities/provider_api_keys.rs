use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_api_keys")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub group_id: String,
    pub api_key: String,
    pub key_order: i32,
    pub is_valid: Option<bool>,
    pub last_validated_at: Option<OffsetDateTime>,
    pub validation_error: Option<String>,
    pub created_at: OffsetDateTime,
    #[sea_orm(belongs_to, from = "group_id", to = "group_id", on_delete = "Cascade")]
    pub group: HasOne<super::provider_groups::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
