//! Provider router (C4, spec §4.4): candidate-group enumeration and ordering.

use turnsapi_provider_core::{Group, ProviderFamily};

use crate::error::ProxyError;
use crate::state::AppState;

fn is_allowed(allowed: &[String], group_id: &str) -> bool {
    allowed.is_empty() || allowed.iter().any(|g| g == group_id)
}

fn sort_by_failures(state: &AppState, model: &str, groups: &mut [Group]) {
    groups.sort_by(|a, b| {
        state
            .failures
            .ordering_key(model, &a.id)
            .cmp(&state.failures.ordering_key(model, &b.id))
    });
}

/// Enumerates candidate groups for `model`, restricted to `allowed` (empty
/// means "all enabled groups"), in the priority order §4.4 specifies.
pub fn groups_for_model(state: &AppState, model: &str, allowed: &[String]) -> Vec<Group> {
    let accessible: Vec<Group> = state
        .enabled_groups()
        .into_iter()
        .filter(|g| is_allowed(allowed, &g.id))
        .collect();

    let mut explicit: Vec<Group> = accessible
        .iter()
        .filter(|g| g.accepts_model(model) && !g.models.is_empty())
        .cloned()
        .collect();
    explicit.retain(|g| !state.failures.is_blocked(model, &g.id));
    if !explicit.is_empty() {
        sort_by_failures(state, model, &mut explicit);
        return explicit;
    }

    if let Some(family) = ProviderFamily::infer_from_model(model) {
        let mut inferred: Vec<Group> = accessible
            .iter()
            .filter(|g| g.provider_family == family && g.models.is_empty())
            .cloned()
            .collect();
        inferred.retain(|g| !state.failures.is_blocked(model, &g.id));
        if !inferred.is_empty() {
            sort_by_failures(state, model, &mut inferred);
            return inferred;
        }
    }

    accessible
        .into_iter()
        .filter(|g| !state.failures.is_blocked(model, &g.id))
        .take(1)
        .collect()
}

/// Resolves a caller-pinned `X-Provider-Group` / `?provider_group=` value,
/// checking existence, permission, and enabled state in that order.
pub fn resolve_pinned(state: &AppState, group_id: &str, allowed: &[String]) -> Result<Group, ProxyError> {
    let group = state
        .group(group_id)
        .ok_or_else(|| ProxyError::group_not_found(group_id))?;
    if !is_allowed(allowed, group_id) {
        return Err(ProxyError::group_not_permitted(group_id));
    }
    if !group.enabled {
        return Err(ProxyError::group_disabled(group_id));
    }
    Ok(group)
}

pub fn report_success(state: &AppState, model: &str, group_id: &str) {
    state.failures.report_success(model, group_id);
}

pub fn report_failure(state: &AppState, model: &str, group_id: &str) {
    state.failures.report_failure(model, group_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use turnsapi_provider_core::{ProviderRegistry, RequestParamOverrides, RotationStrategy};

    fn group(id: &str, family: ProviderFamily, models: Vec<&str>) -> Group {
        Group {
            id: id.to_string(),
            name: id.to_string(),
            provider_family: family,
            base_url: "https://example.invalid".to_string(),
            enabled: true,
            timeout_seconds: 30,
            max_retries: 0,
            rotation_strategy: RotationStrategy::RoundRobin,
            api_keys: vec!["sk-test".to_string()],
            models: models.into_iter().map(String::from).collect(),
            model_aliases: HashMap::new(),
            headers: HashMap::new(),
            request_params: RequestParamOverrides::default(),
            native_response: false,
            rpm_limit: None,
        }
    }

    async fn state_with(groups: Vec<Group>) -> Arc<AppState> {
        use turnsapi_storage::{ProviderGroup, RotationStrategy as StorageRotation};

        struct FakeStorage(Vec<ProviderGroup>);

        #[async_trait::async_trait]
        impl turnsapi_storage::Storage for FakeStorage {
            async fn sync(&self) -> turnsapi_storage::StorageResult<()> {
                Ok(())
            }
            async fn list_groups(&self) -> turnsapi_storage::StorageResult<Vec<ProviderGroup>> {
                Ok(self.0.clone())
            }
            async fn load_group(
                &self,
                group_id: &str,
            ) -> turnsapi_storage::StorageResult<Option<ProviderGroup>> {
                Ok(self.0.iter().find(|g| g.group_id == group_id).cloned())
            }
            async fn save_group(&self, _: &ProviderGroup) -> turnsapi_storage::StorageResult<()> {
                Ok(())
            }
            async fn update_group(&self, _: &ProviderGroup) -> turnsapi_storage::StorageResult<()> {
                Ok(())
            }
            async fn delete_group(&self, _: &str) -> turnsapi_storage::StorageResult<()> {
                Ok(())
            }
            async fn toggle_group(&self, _: &str, _: bool) -> turnsapi_storage::StorageResult<()> {
                Ok(())
            }
            async fn insert_proxy_key(
                &self,
                _: &turnsapi_storage::NewProxyKey,
            ) -> turnsapi_storage::StorageResult<turnsapi_storage::ProxyKey> {
                unimplemented!()
            }
            async fn get_proxy_key_by_secret(
                &self,
                _: &str,
            ) -> turnsapi_storage::StorageResult<Option<turnsapi_storage::ProxyKey>> {
                Ok(None)
            }
            async fn list_proxy_keys(&self) -> turnsapi_storage::StorageResult<Vec<turnsapi_storage::ProxyKey>> {
                Ok(Vec::new())
            }
            async fn update_proxy_key(
                &self,
                _: i64,
                _: &turnsapi_storage::ProxyKeyUpdate,
            ) -> turnsapi_storage::StorageResult<()> {
                Ok(())
            }
            async fn delete_proxy_key(&self, _: i64) -> turnsapi_storage::StorageResult<()> {
                Ok(())
            }
            async fn update_proxy_key_last_used(&self, _: i64) -> turnsapi_storage::StorageResult<()> {
                Ok(())
            }
            async fn update_proxy_key_usage(&self, _: i64) -> turnsapi_storage::StorageResult<()> {
                Ok(())
            }
            async fn insert_request_log(
                &self,
                _: &turnsapi_storage::NewRequestLog,
            ) -> turnsapi_storage::StorageResult<i64> {
                Ok(1)
            }
            async fn list_request_logs(
                &self,
                _: turnsapi_storage::RequestLogFilter,
                _: u64,
                _: u64,
            ) -> turnsapi_storage::StorageResult<Vec<turnsapi_storage::RequestLog>> {
                Ok(Vec::new())
            }
            async fn cleanup_logs_older_than(&self, _: u32) -> turnsapi_storage::StorageResult<u64> {
                Ok(0)
            }
        }

        let now = time::OffsetDateTime::now_utc();
        let rows = groups
            .into_iter()
            .map(|g| ProviderGroup {
                group_id: g.id.clone(),
                name: g.name.clone(),
                provider_type: super::super::state::family_registry_key(g.provider_family).to_string(),
                base_url: g.base_url.clone(),
                enabled: g.enabled,
                timeout_seconds: g.timeout_seconds as i32,
                max_retries: g.max_retries as i32,
                rotation_strategy: StorageRotation::RoundRobin,
                models: g.models.clone(),
                headers: Vec::new(),
                request_params: None,
                keys: g
                    .api_keys
                    .iter()
                    .enumerate()
                    .map(|(i, k)| turnsapi_storage::ApiKeyRecord {
                        id: i as i64,
                        group_id: g.id.clone(),
                        api_key: k.clone(),
                        key_order: i as i32,
                        is_valid: None,
                        last_validated_at: None,
                        validation_error: None,
                        created_at: now,
                    })
                    .collect(),
                created_at: now,
                updated_at: now,
            })
            .collect();

        AppState::bootstrap(
            turnsapi_common::GlobalConfig::default(),
            Arc::new(FakeStorage(rows)),
            Arc::new(ProviderRegistry::new()),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn explicit_model_list_wins_over_inference() {
        let explicit = group("g1", ProviderFamily::Openai, vec!["gpt-4o-mini"]);
        let inferred = group("g2", ProviderFamily::Openai, vec![]);
        let state = state_with(vec![explicit, inferred]).await;
        let candidates = groups_for_model(&state, "gpt-4o-mini", &[]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "g1");
    }

    #[tokio::test]
    async fn falls_back_to_family_inference_when_no_explicit_list_matches() {
        let inferred = group("g2", ProviderFamily::Anthropic, vec![]);
        let state = state_with(vec![inferred]).await;
        let candidates = groups_for_model(&state, "claude-3-opus", &[]);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, "g2");
    }

    #[tokio::test]
    async fn blocked_group_is_skipped_from_ordering() {
        let g = group("g1", ProviderFamily::Openai, vec!["gpt-4o-mini"]);
        let state = state_with(vec![g]).await;
        state.failures.report_failure("gpt-4o-mini", "g1");
        state.failures.report_failure("gpt-4o-mini", "g1");
        state.failures.report_failure("gpt-4o-mini", "g1");
        let candidates = groups_for_model(&state, "gpt-4o-mini", &[]);
        assert!(candidates.is_empty());
    }
}
