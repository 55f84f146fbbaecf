pub mod provider_api_keys;
pub mod provider_groups;
pub mod proxy_keys;
pub mod request_logs;

pub use provider_api_keys::Entity as ProviderApiKeys;
pub use provider_groups::Entity as ProviderGroups;
pub use proxy_keys::Entity as ProxyKeys;
pub use request_logs::Entity as RequestLogs;
