use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Per-group request-parameter overrides, plus the dispatch knobs (model
/// aliasing, native-response passthrough, RPM limit) that have no column of
/// their own in `provider_groups` and ride along in the same JSON blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestParamOverrides {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub stop: Option<Vec<String>>,
    #[serde(default)]
    pub model_aliases: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub native_response: bool,
    #[serde(default)]
    pub rpm_limit: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    RoundRobin,
    Random,
    LeastUsed,
}

/// One API key belonging to a group, with its mutable health fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: i64,
    pub group_id: String,
    pub api_key: String,
    pub key_order: i32,
    pub is_valid: Option<bool>,
    pub last_validated_at: Option<OffsetDateTime>,
    pub validation_error: Option<String>,
    pub created_at: OffsetDateTime,
}

/// A configured upstream pool, with its ordered keys attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderGroup {
    pub group_id: String,
    pub name: String,
    pub provider_type: String,
    pub base_url: String,
    pub enabled: bool,
    pub timeout_seconds: i32,
    pub max_retries: i32,
    pub rotation_strategy: RotationStrategy,
    pub models: Vec<String>,
    pub headers: Vec<(String, String)>,
    pub request_params: Option<RequestParamOverrides>,
    pub keys: Vec<ApiKeyRecord>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSelectionConfig {
    pub preferred_group: Option<String>,
    pub sticky: bool,
}

/// An externally issued bearer token and its permission/usage state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyKey {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub key: String,
    pub allowed_groups: Vec<String>,
    pub group_selection_config: Option<GroupSelectionConfig>,
    pub is_active: bool,
    pub usage_count: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
}

impl ProxyKey {
    /// Empty allowed-groups means "all enabled groups" (invariant 7).
    pub fn can_reach(&self, group_id: &str) -> bool {
        self.allowed_groups.is_empty() || self.allowed_groups.iter().any(|g| g == group_id)
    }
}

#[derive(Debug, Clone)]
pub struct NewProxyKey {
    pub name: String,
    pub description: Option<String>,
    pub key: String,
    pub allowed_groups: Vec<String>,
    pub group_selection_config: Option<GroupSelectionConfig>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProxyKeyUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub allowed_groups: Option<Vec<String>>,
    pub group_selection_config: Option<Option<GroupSelectionConfig>>,
    pub is_active: Option<bool>,
}

/// One row per upstream attempt, persisted append-only.
#[derive(Debug, Clone)]
pub struct NewRequestLog {
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
    pub has_tool_calls: bool,
    pub tool_calls_count: i32,
    pub tool_names: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestLog {
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
}

#[derive(Debug, Clone, Default)]
pub struct RequestLogFilter {
    pub proxy_key_id: Option<i64>,
    pub proxy_key_name: Option<String>,
    pub provider_group: Option<String>,
    pub model: Option<String>,
    pub status_code: Option<i32>,
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
}

/// Storage is consumed by:
/// - bootstrap (`list_groups`, building the in-memory router/key-manager state)
/// - the admin collaborator contracts (§6) — groups, proxy keys
/// - C7, the request logger (append-only writes, retention sweep)
///
/// Runtime request handling never reads through this trait for hot-path
/// decisions; the router and key manager hold their own in-memory state,
/// refreshed from here only on admin mutation.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync (SeaORM 2.0). Run once at startup.
    async fn sync(&self) -> StorageResult<()>;

    // Groups
    async fn list_groups(&self) -> StorageResult<Vec<ProviderGroup>>;
    async fn load_group(&self, group_id: &str) -> StorageResult<Option<ProviderGroup>>;
    async fn save_group(&self, group: &ProviderGroup) -> StorageResult<()>;
    async fn update_group(&self, group: &ProviderGroup) -> StorageResult<()>;
    async fn delete_group(&self, group_id: &str) -> StorageResult<()>;
    async fn toggle_group(&self, group_id: &str, enabled: bool) -> StorageResult<()>;

    // Proxy keys
    async fn insert_proxy_key(&self, input: &NewProxyKey) -> StorageResult<ProxyKey>;
    async fn get_proxy_key_by_secret(&self, secret: &str) -> StorageResult<Option<ProxyKey>>;
    async fn list_proxy_keys(&self) -> StorageResult<Vec<ProxyKey>>;
    async fn update_proxy_key(&self, id: i64, update: &ProxyKeyUpdate) -> StorageResult<()>;
    async fn delete_proxy_key(&self, id: i64) -> StorageResult<()>;
    async fn update_proxy_key_last_used(&self, id: i64) -> StorageResult<()>;
    async fn update_proxy_key_usage(&self, id: i64) -> StorageResult<()>;

    // Request logs
    async fn insert_request_log(&self, log: &NewRequestLog) -> StorageResult<i64>;
    async fn list_request_logs(
        &self,
        filter: RequestLogFilter,
        limit: u64,
        offset: u64,
    ) -> StorageResult<Vec<RequestLog>>;
    async fn cleanup_logs_older_than(&self, days: u32) -> StorageResult<u64>;
}
