//! Retry/failover orchestrator (C5, spec §4.5): walks router-ordered
//! candidate groups breadth-first, spending a shared 3-attempt budget.

use std::future::Future;
use std::sync::Arc;

use turnsapi_protocol::canonical::{ChatRequest, ChatResponse, StopSequences};
use turnsapi_provider_core::{ChunkStream, DispatchContext, Group, Provider, ProviderError};

use crate::error::ProxyError;
use crate::router;
use crate::state::AppState;

/// Hard cap on upstream attempts per inbound request, independent of how
/// many candidate groups or keys are available (spec §4.5).
const MAX_ATTEMPTS: u32 = 3;

/// Independent upper bound on a single upstream attempt (spec §5): cancels
/// the in-flight call on expiry and counts the attempt as a failure.
const ATTEMPT_DEADLINE: std::time::Duration = std::time::Duration::from_secs(300);

/// Applies a group's request-parameter overrides, then resolves any model
/// alias. Fields the override leaves `None` pass the caller's value through.
fn prepare_request(group: &Group, request: &ChatRequest) -> ChatRequest {
    let mut req = request.clone();
    req.model = group.resolve_alias(&request.model).to_string();
    let overrides = &group.request_params;
    if let Some(temperature) = overrides.temperature {
        req.temperature = Some(temperature);
    }
    if let Some(max_tokens) = overrides.max_tokens {
        req.max_tokens = Some(max_tokens);
    }
    if let Some(top_p) = overrides.top_p {
        req.top_p = Some(top_p);
    }
    if let Some(stop) = &overrides.stop {
        req.stop = Some(StopSequences::Many(stop.clone()));
    }
    req
}

fn build_context(group: &Group, api_key: &str, model: &str) -> DispatchContext {
    DispatchContext {
        api_key: api_key.to_string(),
        base_url: group.base_url.clone(),
        model: model.to_string(),
        timeout_seconds: group.timeout_seconds,
        headers: group.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
    }
}

/// One candidate group ready to be walked: its provider adapter and active
/// keys already resolved and priority-sorted (spec §4.5 step 2), so the
/// round loop below only ever indexes into `keys`.
struct Lane<'a> {
    group: &'a Group,
    provider: Arc<dyn Provider>,
    keys: Vec<turnsapi_provider_core::ApiKey>,
}

/// Walks `candidates` breadth-first (spec §4.5): round index `i = 0, 1, …`;
/// at each `i`, try each lane's `i`-th priority-ranked key before moving to
/// `i+1`. A lane drops out once its keys are exhausted; the walk stops once
/// every lane has dropped out or the shared 3-attempt budget is spent.
async fn walk<F, Fut, T>(
    state: &AppState,
    candidates: &[Group],
    original: &ChatRequest,
    mut call: F,
) -> Result<(Group, String, T), ProxyError>
where
    F: FnMut(&Group, Arc<dyn Provider>, DispatchContext, ChatRequest) -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    if candidates.is_empty() {
        return Err(ProxyError::no_candidates());
    }

    let model = original.model.clone();
    let mut lanes: Vec<Lane> = Vec::with_capacity(candidates.len());
    let mut rpm_rejected = false;

    for group in candidates {
        if group.rpm_limit.is_some() && !state.rpm.allow(&group.id) {
            rpm_rejected = true;
            router::report_failure(state, &model, &group.id);
            continue;
        }

        let family = crate::state::family_registry_key(group.provider_family);
        let Some(provider) = state.registry.get(family) else {
            continue;
        };

        let keys = match state.key_manager.priority_sorted_active_keys(&group.id).await {
            Ok(keys) => keys,
            Err(_) => continue,
        };

        lanes.push(Lane { group, provider, keys });
    }

    if lanes.is_empty() {
        return Err(if rpm_rejected {
            ProxyError::rate_limited()
        } else {
            ProxyError::no_candidates()
        });
    }

    let mut attempts_used = 0u32;
    let mut last_err: Option<ProviderError> = None;
    let max_round = lanes.iter().map(|lane| lane.keys.len()).max().unwrap_or(0);

    'rounds: for round in 0..max_round {
        for lane in &lanes {
            if attempts_used >= MAX_ATTEMPTS {
                break 'rounds;
            }
            let Some(key) = lane.keys.get(round) else {
                continue;
            };
            attempts_used += 1;

            state.key_manager.mark_attempt(&lane.group.id, &key.secret).await;

            let request = prepare_request(lane.group, original);
            let ctx = build_context(lane.group, &key.secret, &request.model);

            let outcome = match tokio::time::timeout(
                ATTEMPT_DEADLINE,
                call(lane.group, lane.provider.clone(), ctx, request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Connection("attempt exceeded the 300s deadline".to_string())),
            };

            match outcome {
                Ok(value) => {
                    state.key_manager.report_success(&lane.group.id, &key.secret).await;
                    router::report_success(state, &model, &lane.group.id);
                    return Ok((lane.group.clone(), key.secret.clone(), value));
                }
                Err(err) => {
                    state
                        .key_manager
                        .report_error(&lane.group.id, &key.secret, &err.to_string())
                        .await;
                    router::report_failure(state, &model, &lane.group.id);
                    last_err = Some(err);
                }
            }
        }
    }

    match last_err {
        Some(err) => Err(ProxyError::from_provider_error(&err)),
        None if rpm_rejected => Err(ProxyError::rate_limited()),
        None => Err(ProxyError::no_candidates()),
    }
}

/// Non-streaming dispatch. Every attempt runs to completion before the next
/// one starts, so a failed attempt can be retried transparently.
pub async fn dispatch_chat(
    state: &AppState,
    candidates: &[Group],
    request: &ChatRequest,
) -> Result<(Group, String, ChatResponse), ProxyError> {
    walk(state, candidates, request, |_group, provider, ctx, req| async move {
        provider.chat(&ctx, &req).await
    })
    .await
}

/// Streaming dispatch. The attempt is the act of establishing the chunk
/// stream; once a provider returns `Ok(ChunkStream)`, headers are already
/// on their way to the client and that group/key is committed — mid-stream
/// errors are handled by the C8 pipeline, not retried here.
pub async fn dispatch_chat_stream(
    state: &AppState,
    candidates: &[Group],
    request: &ChatRequest,
) -> Result<(Group, String, ChunkStream), ProxyError> {
    walk(state, candidates, request, |group, provider, ctx, req| {
        let native = group.native_response;
        async move {
            if native {
                provider.chat_stream_native(&ctx, &req).await
            } else {
                provider.chat_stream(&ctx, &req).await
            }
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use turnsapi_protocol::canonical::{ChatChoice, FinishReason, ResponseMessage, Role, Usage};
    use turnsapi_provider_core::{ProviderFamily, ProviderRegistry, RequestParamOverrides, RotationStrategy};

    /// A provider whose `chat` call fails the first `fail_times` calls, then
    /// succeeds; lets a single test drive both the failover and the
    /// attempt-budget paths without touching the network.
    struct FlakyProvider {
        family: &'static str,
        calls: AtomicU32,
        fail_times: u32,
    }

    #[async_trait::async_trait]
    impl Provider for FlakyProvider {
        fn family(&self) -> &'static str {
            self.family
        }

        async fn chat(
            &self,
            _ctx: &DispatchContext,
            req: &ChatRequest,
        ) -> turnsapi_provider_core::ProviderResult<ChatResponse> {
            let call_index = self.calls.fetch_add(1, Ordering::SeqCst);
            if call_index < self.fail_times {
                return Err(ProviderError::UpstreamServer {
                    status: 503,
                    body: "temporarily unavailable".to_string(),
                });
            }
            Ok(ChatResponse {
                id: "resp-1".to_string(),
                object: "chat.completion".to_string(),
                created: 0,
                model: req.model.clone(),
                choices: vec![ChatChoice {
                    index: 0,
                    message: ResponseMessage {
                        role: Role::Assistant,
                        content: Some("ok".to_string()),
                        tool_calls: None,
                    },
                    finish_reason: FinishReason::Stop,
                }],
                usage: Usage {
                    prompt_tokens: 1,
                    completion_tokens: 1,
                    total_tokens: 2,
                },
            })
        }

        async fn chat_stream(
            &self,
            _ctx: &DispatchContext,
            _req: &ChatRequest,
        ) -> turnsapi_provider_core::ProviderResult<ChunkStream> {
            unimplemented!("not exercised by these tests")
        }

        async fn chat_stream_native(
            &self,
            _ctx: &DispatchContext,
            _req: &ChatRequest,
        ) -> turnsapi_provider_core::ProviderResult<ChunkStream> {
            unimplemented!("not exercised by these tests")
        }

        async fn list_models(
            &self,
            _ctx: &DispatchContext,
        ) -> turnsapi_provider_core::ProviderResult<turnsapi_protocol::canonical::ModelsResponse> {
            unimplemented!("not exercised by these tests")
        }

        async fn health_check(&self, _ctx: &DispatchContext) -> turnsapi_provider_core::ProviderResult<()> {
            Ok(())
        }
    }

    fn sample_request() -> ChatRequest {
        ChatRequest {
            model: "gpt-4o-mini".to_string(),
            messages: vec![turnsapi_protocol::canonical::Message {
                role: Role::User,
                content: turnsapi_protocol::canonical::Content::Text("hi".to_string()),
                name: None,
                tool_call_id: None,
                tool_calls: None,
            }],
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
            stream: None,
        }
    }

    fn group_with_keys(id: &str, keys: &[&str]) -> Group {
        Group {
            id: id.to_string(),
            name: id.to_string(),
            provider_family: ProviderFamily::Openai,
            base_url: "https://example.invalid".to_string(),
            enabled: true,
            timeout_seconds: 30,
            max_retries: 0,
            rotation_strategy: RotationStrategy::RoundRobin,
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            models: vec!["gpt-4o-mini".to_string()],
            model_aliases: HashMap::new(),
            headers: HashMap::new(),
            request_params: RequestParamOverrides::default(),
            native_response: false,
            rpm_limit: None,
        }
    }

    async fn state_with(groups: &[Group], registry: ProviderRegistry) -> Arc<AppState> {
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
            .iter()
            .map(|g| ProviderGroup {
                group_id: g.id.clone(),
                name: g.name.clone(),
                provider_type: crate::state::family_registry_key(g.provider_family).to_string(),
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
            Arc::new(registry),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn succeeds_on_the_first_attempt() {
        let group = group_with_keys("g1", &["sk-aaa"]);
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FlakyProvider {
            family: "openai",
            calls: AtomicU32::new(0),
            fail_times: 0,
        }));
        let state = state_with(std::slice::from_ref(&group), registry).await;
        let candidates = router::groups_for_model(&state, "gpt-4o-mini", &[]);
        let (won, _key, response) = dispatch_chat(&state, &candidates, &sample_request()).await.unwrap();
        assert_eq!(won.id, "g1");
        assert_eq!(response.choices.len(), 1);
    }

    #[tokio::test]
    async fn retries_across_keys_within_the_attempt_budget() {
        let group = group_with_keys("g1", &["sk-aaa", "sk-bbb", "sk-ccc"]);
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FlakyProvider {
            family: "openai",
            calls: AtomicU32::new(0),
            fail_times: 2,
        }));
        let state = state_with(std::slice::from_ref(&group), registry).await;
        let candidates = router::groups_for_model(&state, "gpt-4o-mini", &[]);
        let result = dispatch_chat(&state, &candidates, &sample_request()).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn exhausting_the_budget_surfaces_the_last_upstream_error() {
        let group = group_with_keys("g1", &["sk-aaa", "sk-bbb", "sk-ccc", "sk-ddd"]);
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FlakyProvider {
            family: "openai",
            calls: AtomicU32::new(0),
            fail_times: 10,
        }));
        let state = state_with(std::slice::from_ref(&group), registry).await;
        let candidates = router::groups_for_model(&state, "gpt-4o-mini", &[]);
        let err = dispatch_chat(&state, &candidates, &sample_request())
            .await
            .unwrap_err();
        assert_eq!(err.code, "upstream_error");
    }

    #[tokio::test]
    async fn rpm_rejected_group_is_skipped_without_spending_attempt_budget() {
        let mut limited = group_with_keys("g1", &["sk-aaa"]);
        limited.rpm_limit = Some(1);
        let fallback = group_with_keys("g2", &["sk-bbb"]);
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FlakyProvider {
            family: "openai",
            calls: AtomicU32::new(0),
            fail_times: 0,
        }));
        let state = state_with(&[limited.clone(), fallback], registry).await;
        state.rpm.set_limit(&limited.id, Some(1));
        assert!(state.rpm.allow(&limited.id));
        assert!(!state.rpm.allow(&limited.id));

        let candidates = router::groups_for_model(&state, "gpt-4o-mini", &[]);
        let (won, _key, _) = dispatch_chat(&state, &candidates, &sample_request()).await.unwrap();
        assert_eq!(won.id, "g2");
    }

    /// spec.md's S2 scenario: two single-key groups, the first fails, the
    /// second succeeds. A depth-first walk would burn the whole 3-attempt
    /// budget retrying g1's one key before ever reaching g2.
    #[tokio::test]
    async fn breadth_first_walk_reaches_the_second_group_after_one_failure() {
        let g1 = group_with_keys("g1", &["sk-a1"]);
        let g2 = group_with_keys("g2", &["sk-b1"]);
        let provider = Arc::new(FlakyProvider {
            family: "openai",
            calls: AtomicU32::new(0),
            fail_times: 1,
        });
        let mut registry = ProviderRegistry::new();
        registry.register(provider.clone());
        let state = state_with(&[g1, g2], registry).await;

        let candidates = router::groups_for_model(&state, "gpt-4o-mini", &[]);
        let (won, _key, _) = dispatch_chat(&state, &candidates, &sample_request()).await.unwrap();
        assert_eq!(won.id, "g2");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    /// spec.md's S5 scenario: the sole candidate is rejected by RPM admission
    /// before any upstream call is made. The client must see 429
    /// `rate_limit_error`, not the generic 502 `no_candidate_group`, and the
    /// rejection must still count as a failure against that group.
    #[tokio::test]
    async fn rpm_rejected_sole_candidate_returns_rate_limited() {
        let mut group = group_with_keys("g1", &["sk-aaa"]);
        group.rpm_limit = Some(1);
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FlakyProvider {
            family: "openai",
            calls: AtomicU32::new(0),
            fail_times: 0,
        }));
        let state = state_with(std::slice::from_ref(&group), registry).await;
        state.rpm.set_limit(&group.id, Some(1));
        assert!(state.rpm.allow(&group.id));
        assert!(!state.rpm.allow(&group.id));

        let candidates = router::groups_for_model(&state, "gpt-4o-mini", &[]);
        let err = dispatch_chat(&state, &candidates, &sample_request())
            .await
            .unwrap_err();
        assert_eq!(err.code, "rpm_exceeded");
        let (failure_count, _) = state.failures.ordering_key("gpt-4o-mini", &group.id);
        assert_eq!(failure_count, 1);
    }
}
