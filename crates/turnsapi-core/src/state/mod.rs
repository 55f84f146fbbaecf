//! Shared runtime state: the in-memory group cache plus the C2/C3/C4
//! collaborators that live for the lifetime of the process (spec §5).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use arc_swap::ArcSwap;

use turnsapi_common::GlobalConfig;
use turnsapi_provider_core::{
    FailureTracker, GroupKeyManager, ProviderFamily, ProviderRegistry, RotationStrategy as CoreRotation,
};
use turnsapi_storage::{ProviderGroup, ProxyKey, RotationStrategy as StorageRotation, Storage};

pub struct AppState {
    pub config: GlobalConfig,
    pub storage: Arc<dyn Storage>,
    pub registry: Arc<ProviderRegistry>,
    pub key_manager: Arc<GroupKeyManager>,
    pub rpm: Arc<turnsapi_provider_core::RpmLimiter>,
    pub failures: Arc<FailureTracker>,
    groups: ArcSwap<HashMap<String, turnsapi_provider_core::Group>>,
    proxy_keys: ArcSwap<HashMap<String, ProxyKey>>,
}

impl AppState {
    pub async fn bootstrap(
        config: GlobalConfig,
        storage: Arc<dyn Storage>,
        registry: Arc<ProviderRegistry>,
    ) -> anyhow::Result<Arc<Self>> {
        let state = Arc::new(Self {
            config,
            storage,
            registry,
            key_manager: GroupKeyManager::new(),
            rpm: Arc::new(turnsapi_provider_core::RpmLimiter::new()),
            failures: Arc::new(FailureTracker::new()),
            groups: ArcSwap::from_pointee(HashMap::new()),
            proxy_keys: ArcSwap::from_pointee(HashMap::new()),
        });
        state.reload_groups().await?;
        state.reload_proxy_keys().await?;
        state.validate_startup()?;
        Ok(state)
    }

    /// Re-reads every group from storage, rebuilds the in-memory cache, and
    /// pushes the new key lists / RPM limits into C2 / C3. Call after any
    /// admin mutation (spec §5: "admin writes ... invalidate/refresh
    /// in-memory caches").
    pub async fn reload_groups(&self) -> anyhow::Result<()> {
        let rows = self.storage.list_groups().await.context("list_groups")?;
        let mut map = HashMap::with_capacity(rows.len());
        for row in &rows {
            let group = to_core_group(row)?;
            self.key_manager
                .update_group_config(
                    &group.id,
                    group.rotation_strategy,
                    Some(&group.api_keys),
                )
                .await;
            match group.rpm_limit {
                Some(limit) => self.rpm.set_limit(&group.id, Some(limit)),
                None => self.rpm.remove_limit(&group.id),
            }
            map.insert(group.id.clone(), group);
        }
        self.groups.store(Arc::new(map));
        Ok(())
    }

    pub async fn reload_proxy_keys(&self) -> anyhow::Result<()> {
        let rows = self.storage.list_proxy_keys().await.context("list_proxy_keys")?;
        let map = rows.into_iter().map(|k| (k.key.clone(), k)).collect();
        self.proxy_keys.store(Arc::new(map));
        Ok(())
    }

    /// Startup validation (spec §6 CLI surface): reject configurations with
    /// no groups at all, or no enabled group carrying ≥1 key.
    fn validate_startup(&self) -> anyhow::Result<()> {
        let groups = self.groups.load();
        if groups.is_empty() {
            bail!("no provider groups configured");
        }
        if !groups.values().any(|g| g.enabled && !g.api_keys.is_empty()) {
            bail!("no enabled group has at least one api key");
        }
        Ok(())
    }

    pub fn group(&self, group_id: &str) -> Option<turnsapi_provider_core::Group> {
        self.groups.load().get(group_id).cloned()
    }

    pub fn all_groups(&self) -> Arc<HashMap<String, turnsapi_provider_core::Group>> {
        self.groups.load_full()
    }

    pub fn enabled_groups(&self) -> Vec<turnsapi_provider_core::Group> {
        self.groups
            .load()
            .values()
            .filter(|g| g.enabled)
            .cloned()
            .collect()
    }

    /// Looks up a proxy key by its raw secret. Falls through to storage on a
    /// cache miss so a key created by a concurrent admin process is still
    /// honored without a full reload.
    pub async fn proxy_key_by_secret(&self, secret: &str) -> anyhow::Result<Option<ProxyKey>> {
        if let Some(key) = self.proxy_keys.load().get(secret).cloned() {
            return Ok(Some(key));
        }
        self.storage
            .get_proxy_key_by_secret(secret)
            .await
            .context("get_proxy_key_by_secret")
    }
}

fn to_core_group(row: &ProviderGroup) -> anyhow::Result<turnsapi_provider_core::Group> {
    let provider_family = parse_family(&row.provider_type)
        .with_context(|| format!("unknown provider family '{}'", row.provider_type))?;
    let rotation_strategy = match row.rotation_strategy {
        StorageRotation::RoundRobin => CoreRotation::RoundRobin,
        StorageRotation::Random => CoreRotation::Random,
        StorageRotation::LeastUsed => CoreRotation::LeastUsed,
    };
    let mut keys: Vec<_> = row.keys.clone();
    keys.sort_by_key(|k| k.key_order);
    let api_keys = keys.into_iter().map(|k| k.api_key).collect();
    let overrides = row.request_params.clone().unwrap_or_default();

    Ok(turnsapi_provider_core::Group {
        id: row.group_id.clone(),
        name: row.name.clone(),
        provider_family,
        base_url: row.base_url.clone(),
        enabled: row.enabled,
        timeout_seconds: row.timeout_seconds.max(0) as u64,
        max_retries: row.max_retries.max(0) as u32,
        rotation_strategy,
        api_keys,
        models: row.models.clone(),
        model_aliases: overrides.model_aliases.clone(),
        headers: row.headers.iter().cloned().collect(),
        request_params: turnsapi_provider_core::RequestParamOverrides {
            temperature: overrides.temperature,
            max_tokens: overrides.max_tokens.map(i64::from),
            top_p: overrides.top_p,
            stop: overrides.stop,
        },
        native_response: overrides.native_response,
        rpm_limit: overrides.rpm_limit,
    })
}

fn parse_family(value: &str) -> Option<ProviderFamily> {
    match value {
        "openai" => Some(ProviderFamily::Openai),
        "azure_openai" => Some(ProviderFamily::AzureOpenai),
        "anthropic" => Some(ProviderFamily::Anthropic),
        "gemini" => Some(ProviderFamily::Gemini),
        _ => None,
    }
}

/// The registry key a group's family resolves to; matches each adapter's
/// `Provider::family()` literal.
pub fn family_registry_key(family: ProviderFamily) -> &'static str {
    match family {
        ProviderFamily::Openai => "openai",
        ProviderFamily::AzureOpenai => "azure_openai",
        ProviderFamily::Anthropic => "anthropic",
        ProviderFamily::Gemini => "gemini",
    }
}
