//! CLI surface and startup wiring (spec §6): `--config=<path>` (YAML) plus
//! `--db=<path>`, config-driven group/proxy-key seeding, then `AppState`
//! construction and startup validation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use turnsapi_common::GlobalConfig;
use turnsapi_storage::{
    ApiKeyRecord, NewProxyKey, ProviderGroup, RequestParamOverrides, RotationStrategy, SeaOrmStorage,
    Storage,
};

use crate::state::AppState;

#[derive(Debug, Clone, Parser)]
#[command(name = "turnsapi", version, about = "Multi-provider LLM API gateway")]
pub struct CliArgs {
    /// YAML file describing groups, proxy keys, and global settings.
    #[arg(long, env = "TURNSAPI_CONFIG")]
    pub config: PathBuf,

    /// SQLite DSN backing proxy keys and request logs; overrides the
    /// config file's `dsn` field when set.
    #[arg(long, env = "TURNSAPI_DB")]
    pub db: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub log_retention_days: Option<i64>,
    pub dsn: Option<String>,
    #[serde(default)]
    pub groups: Vec<FileGroup>,
    #[serde(default)]
    pub proxy_keys: Vec<FileProxyKey>,
}

fn default_timeout_seconds() -> u32 {
    30
}

fn default_enabled() -> bool {
    true
}

fn default_rotation() -> RotationStrategy {
    RotationStrategy::RoundRobin
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileGroup {
    pub id: String,
    pub name: String,
    pub provider_family: String,
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_rotation")]
    pub rotation_strategy: RotationStrategy,
    pub api_keys: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_aliases: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub request_params: FileRequestParams,
    #[serde(default)]
    pub native_response: bool,
    pub rpm_limit: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileRequestParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub stop: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileProxyKey {
    pub name: String,
    pub description: Option<String>,
    pub secret: String,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
}

pub struct Bootstrap {
    pub storage: Arc<SeaOrmStorage>,
    pub state: Arc<AppState>,
}

pub async fn bootstrap_from_env() -> anyhow::Result<Bootstrap> {
    bootstrap(CliArgs::parse()).await
}

pub async fn bootstrap(args: CliArgs) -> anyhow::Result<Bootstrap> {
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("read config file {}", args.config.display()))?;
    let file: FileConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("parse config file {}", args.config.display()))?;

    let dsn = args
        .db
        .clone()
        .or_else(|| file.dsn.clone())
        .unwrap_or_else(|| GlobalConfig::default().dsn);
    ensure_sqlite_parent_dir(&dsn)?;

    let config = GlobalConfig {
        host: file.host.clone().unwrap_or_else(|| GlobalConfig::default().host),
        port: file.port.unwrap_or_else(|| GlobalConfig::default().port),
        dsn: dsn.clone(),
        log_retention_days: file
            .log_retention_days
            .unwrap_or_else(|| GlobalConfig::default().log_retention_days),
    };

    let storage = Arc::new(SeaOrmStorage::connect(&dsn).await.context("connect storage")?);
    storage.sync().await.context("schema sync")?;

    seed_groups(storage.as_ref(), &file.groups).await?;
    seed_proxy_keys(storage.as_ref(), &file.proxy_keys).await?;

    let registry = Arc::new(turnsapi_provider_impl::builtin_registry());
    let state = AppState::bootstrap(config, storage.clone(), registry)
        .await
        .context("bootstrap app state")?;

    Ok(Bootstrap { storage, state })
}

async fn seed_groups(storage: &dyn Storage, groups: &[FileGroup]) -> anyhow::Result<()> {
    let now = time::OffsetDateTime::now_utc();
    for group in groups {
        let request_params = RequestParamOverrides {
            temperature: group.request_params.temperature,
            max_tokens: group.request_params.max_tokens,
            top_p: group.request_params.top_p,
            stop: group.request_params.stop.clone(),
            model_aliases: group.model_aliases.clone(),
            native_response: group.native_response,
            rpm_limit: group.rpm_limit,
        };
        let row = ProviderGroup {
            group_id: group.id.clone(),
            name: group.name.clone(),
            provider_type: group.provider_family.clone(),
            base_url: group.base_url.clone(),
            enabled: group.enabled,
            timeout_seconds: group.timeout_seconds as i32,
            max_retries: group.max_retries as i32,
            rotation_strategy: group.rotation_strategy,
            models: group.models.clone(),
            headers: group.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            request_params: Some(request_params),
            keys: group
                .api_keys
                .iter()
                .enumerate()
                .map(|(order, key)| ApiKeyRecord {
                    id: 0,
                    group_id: group.id.clone(),
                    api_key: key.clone(),
                    key_order: order as i32,
                    is_valid: None,
                    last_validated_at: None,
                    validation_error: None,
                    created_at: now,
                })
                .collect(),
            created_at: now,
            updated_at: now,
        };
        storage
            .save_group(&row)
            .await
            .with_context(|| format!("seed group '{}'", group.id))?;
    }
    Ok(())
}

async fn seed_proxy_keys(storage: &dyn Storage, keys: &[FileProxyKey]) -> anyhow::Result<()> {
    for key in keys {
        if storage
            .get_proxy_key_by_secret(&key.secret)
            .await
            .context("check existing proxy key")?
            .is_some()
        {
            continue;
        }
        storage
            .insert_proxy_key(&NewProxyKey {
                name: key.name.clone(),
                description: key.description.clone(),
                key: key.secret.clone(),
                allowed_groups: key.allowed_groups.clone(),
                group_selection_config: None,
                is_active: true,
            })
            .await
            .with_context(|| format!("seed proxy key '{}'", key.name))?;
    }
    Ok(())
}

fn ensure_sqlite_parent_dir(dsn: &str) -> anyhow::Result<()> {
    let Some(db_path) = sqlite_file_path_from_dsn(dsn) else {
        return Ok(());
    };
    let Some(parent) = db_path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create sqlite parent dir {}", parent.display()))?;
    Ok(())
}

fn sqlite_file_path_from_dsn(dsn: &str) -> Option<PathBuf> {
    let rest = dsn.strip_prefix("sqlite:")?;
    let path_part = rest.split(['?', '#']).next()?.trim();
    if path_part.is_empty() {
        return None;
    }
    let mut normalized = path_part;
    if let Some(stripped) = normalized.strip_prefix("//") {
        normalized = stripped;
    }
    if normalized.to_ascii_lowercase() == ":memory:" {
        return None;
    }
    Some(PathBuf::from(normalized))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_dsn_resolves_relative_path() {
        let path = sqlite_file_path_from_dsn("sqlite://turnsapi.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "turnsapi.db");
    }

    #[test]
    fn sqlite_dsn_resolves_absolute_path() {
        let path = sqlite_file_path_from_dsn("sqlite://app/data/turnsapi.db?mode=rwc").unwrap();
        assert_eq!(path.to_string_lossy(), "/app/data/turnsapi.db");
    }

    #[test]
    fn sqlite_memory_dsn_is_ignored() {
        assert!(sqlite_file_path_from_dsn("sqlite::memory:").is_none());
        assert!(sqlite_file_path_from_dsn("sqlite://:memory:").is_none());
    }

    #[test]
    fn parses_a_minimal_yaml_config() {
        let yaml = r#"
host: 127.0.0.1
port: 9000
groups:
  - id: g1
    name: Primary
    provider_family: openai
    base_url: https://api.openai.com
    api_keys: ["sk-aaa"]
proxy_keys:
  - name: default
    secret: sk-turns-aaaa
"#;
        let file: FileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(file.groups.len(), 1);
        assert_eq!(file.groups[0].timeout_seconds, 30);
        assert!(file.groups[0].enabled);
        assert_eq!(file.proxy_keys[0].secret, "sk-turns-aaaa");
    }
}
