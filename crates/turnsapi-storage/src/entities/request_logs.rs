use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "request_logs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment)]
    pub id: i64,
    pub proxy_key_name: String,
    pub proxy_key_id: i64,
    pub provider_group: String,
    pub openrouter_key: String,
    pub model: String,
    pub request_body: String,
    pub response_body: Option<String>,
    pub status_code: i32,
    pub is_stream: bool,
    pub duration: i64,
    pub tokens_used: i64,
    pub tokens_estimated: bool,
    pub error: Option<String>,
    pub client_ip: String,
    pub created_at: OffsetDateTime,
    pub has_tool_calls: bool,
    pub tool_calls_count: i32,
    pub tool_names: Option<String>,
    #[sea_orm(belongs_to, from = "proxy_key_id", to = "id", on_delete = "Cascade")]
    pub proxy_key: HasOne<super::proxy_keys::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
