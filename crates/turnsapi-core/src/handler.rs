//! HTTP surface (spec §6): chat completions, models listing, health.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use turnsapi_protocol::canonical::{ChatRequest, ModelInfo, ModelsResponse};

use crate::auth;
use crate::error::ProxyError;
use crate::logger::{self, LogInput};
use crate::orchestrator;
use crate::router;
use crate::state::AppState;
use crate::streaming;

const GROUP_HEADER: &str = "x-provider-group";

#[derive(Debug, Deserialize, Default)]
pub struct ProviderGroupQuery {
    provider_group: Option<String>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/models", get(list_models))
        .route("/health", get(health))
        .with_state(state)
}

fn pinned_group_id(headers: &HeaderMap, query: &ProviderGroupQuery) -> Option<String> {
    headers
        .get(GROUP_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.provider_group.clone())
}

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ProviderGroupQuery>,
    body: axum::body::Bytes,
) -> Response {
    let started_at = Instant::now();

    let proxy_key = match auth::authenticate(&state, &headers).await {
        Ok(key) => key,
        Err(err) => return err.into_response(),
    };

    let request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(err) => return ProxyError::bad_json(err.to_string()).into_response(),
    };
    if request.model.is_empty() {
        return ProxyError::missing_model().into_response();
    }
    if request.messages.is_empty() {
        return ProxyError::missing_messages().into_response();
    }

    let candidates = match pinned_group_id(&headers, &query) {
        Some(group_id) => match router::resolve_pinned(&state, &group_id, &proxy_key.allowed_groups) {
            Ok(group) => vec![group],
            Err(err) => return err.into_response(),
        },
        None => router::groups_for_model(&state, &request.model, &proxy_key.allowed_groups),
    };

    let client_ip = logger::client_ip(&headers, Some(&peer.ip().to_string()));
    let request_body_text = String::from_utf8_lossy(&body).into_owned();
    let is_stream = request.is_streaming();

    if is_stream {
        handle_stream(&state, candidates, request, started_at, proxy_key, client_ip, request_body_text).await
    } else {
        handle_non_stream(&state, candidates, request, started_at, proxy_key, client_ip, request_body_text).await
    }
}

async fn handle_non_stream(
    state: &Arc<AppState>,
    candidates: Vec<turnsapi_provider_core::Group>,
    request: ChatRequest,
    started_at: Instant,
    proxy_key: turnsapi_storage::ProxyKey,
    client_ip: String,
    request_body_text: String,
) -> Response {
    let model = request.model.clone();
    match orchestrator::dispatch_chat(state, &candidates, &request).await {
        Ok((group, upstream_key, response)) => {
            let duration_ms = started_at.elapsed().as_millis() as i64;
            let response_body_text = serde_json::to_string(&response).unwrap_or_default();
            let (has_tool_calls, tool_calls_count, tool_names) = logger::tool_call_summary(&response);
            let tokens_used = response.usage.total_tokens;
            let state = Arc::clone(state);
            let log = LogInput {
                proxy_key_name: proxy_key.name.clone(),
                proxy_key_id: proxy_key.id,
                group_id: group.id.clone(),
                upstream_key,
                model,
                request_body: request_body_text,
                response_body: Some(response_body_text),
                status_code: StatusCode::OK.as_u16() as i32,
                is_stream: false,
                duration_ms,
                tokens_used,
                tokens_estimated: false,
                error: None,
                client_ip,
                has_tool_calls,
                tool_calls_count,
                tool_names,
            };
            tokio::spawn(async move { logger::log_request(&state, log).await });
            Json(response).into_response()
        }
        Err(err) => {
            let duration_ms = started_at.elapsed().as_millis() as i64;
            let status = err.kind_status();
            let state = Arc::clone(state);
            let log = LogInput {
                proxy_key_name: proxy_key.name.clone(),
                proxy_key_id: proxy_key.id,
                group_id: String::new(),
                upstream_key: String::new(),
                model,
                request_body: request_body_text,
                response_body: None,
                status_code: status.as_u16() as i32,
                is_stream: false,
                duration_ms,
                tokens_used: 0,
                tokens_estimated: true,
                error: Some(err.message.clone()),
                client_ip,
                has_tool_calls: false,
                tool_calls_count: 0,
                tool_names: None,
            };
            tokio::spawn(async move { logger::log_request(&state, log).await });
            err.into_response()
        }
    }
}

async fn handle_stream(
    state: &Arc<AppState>,
    candidates: Vec<turnsapi_provider_core::Group>,
    request: ChatRequest,
    started_at: Instant,
    proxy_key: turnsapi_storage::ProxyKey,
    client_ip: String,
    request_body_text: String,
) -> Response {
    let model = request.model.clone();
    match orchestrator::dispatch_chat_stream(state, &candidates, &request).await {
        Ok((group, upstream_key, chunk_stream)) => {
            let (teed, outcome_rx) = streaming::tee(chunk_stream);
            let state = Arc::clone(state);
            tokio::spawn(async move {
                let outcome = outcome_rx.await;
                let duration_ms = started_at.elapsed().as_millis() as i64;
                let (tokens_used, tokens_estimated) = outcome
                    .as_ref()
                    .map(|o| streaming::extract_tokens(&o.captured_text))
                    .unwrap_or((0, true));
                let (status_code, error) = match &outcome {
                    Ok(o) if o.success => (StatusCode::OK.as_u16() as i32, None),
                    Ok(_) => (
                        StatusCode::BAD_GATEWAY.as_u16() as i32,
                        Some("stream ended before any bytes were received".to_string()),
                    ),
                    Err(_) => (
                        StatusCode::BAD_GATEWAY.as_u16() as i32,
                        Some("stream capture channel dropped".to_string()),
                    ),
                };
                let response_body = outcome.ok().map(|o| o.captured_text);
                let log = LogInput {
                    proxy_key_name: proxy_key.name,
                    proxy_key_id: proxy_key.id,
                    group_id: group.id.clone(),
                    upstream_key,
                    model,
                    request_body: request_body_text,
                    response_body,
                    status_code,
                    is_stream: true,
                    duration_ms,
                    tokens_used,
                    tokens_estimated,
                    error,
                    client_ip,
                    has_tool_calls: false,
                    tool_calls_count: 0,
                    tool_names: None,
                };
                logger::log_request(&state, log).await;
            });

            let body = axum::body::Body::from_stream(sse_bytes(teed));
            let mut response = Response::new(body);
            let headers = response.headers_mut();
            headers.insert(
                axum::http::header::CONTENT_TYPE,
                "text/event-stream".parse().unwrap(),
            );
            headers.insert(axum::http::header::CACHE_CONTROL, "no-cache".parse().unwrap());
            headers.insert(axum::http::header::CONNECTION, "keep-alive".parse().unwrap());
            response
        }
        Err(err) => {
            let duration_ms = started_at.elapsed().as_millis() as i64;
            let status = err.kind_status();
            let state = Arc::clone(state);
            let log = LogInput {
                proxy_key_name: proxy_key.name.clone(),
                proxy_key_id: proxy_key.id,
                group_id: String::new(),
                upstream_key: String::new(),
                model,
                request_body: request_body_text,
                response_body: None,
                status_code: status.as_u16() as i32,
                is_stream: true,
                duration_ms,
                tokens_used: 0,
                tokens_estimated: true,
                error: Some(err.message.clone()),
                client_ip,
                has_tool_calls: false,
                tool_calls_count: 0,
                tool_names: None,
            };
            tokio::spawn(async move { logger::log_request(&state, log).await });
            err.into_response()
        }
    }
}

/// Adapts a `ChunkStream` (`Result<Vec<u8>, ProviderError>`) to the
/// `Result<Bytes, io::Error>` shape `Body::from_stream` expects.
fn sse_bytes(
    stream: turnsapi_provider_core::ChunkStream,
) -> impl futures_util::Stream<Item = Result<bytes::Bytes, std::io::Error>> {
    use futures_util::StreamExt;
    stream.map(|item| {
        item.map(bytes::Bytes::from)
            .map_err(|err| std::io::Error::other(err.to_string()))
    })
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: String,
}

async fn health() -> impl IntoResponse {
    Json(HealthBody {
        status: "ok",
        timestamp: time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default(),
    })
}

/// Model-listing precedence (resolved Open Question): a group's configured
/// list wins; otherwise the upstream is queried live. Alias entries are
/// injected in both cases; no sentinel "all models" row is ever emitted.
async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ProviderGroupQuery>,
) -> Response {
    let proxy_key = match auth::authenticate(&state, &headers).await {
        Ok(key) => key,
        Err(err) => return err.into_response(),
    };

    let groups: Vec<turnsapi_provider_core::Group> = match &query.provider_group {
        Some(group_id) => match router::resolve_pinned(&state, group_id, &proxy_key.allowed_groups) {
            Ok(group) => vec![group],
            Err(err) => return err.into_response(),
        },
        None => state
            .enabled_groups()
            .into_iter()
            .filter(|g| proxy_key.can_reach(&g.id))
            .collect(),
    };

    let mut models = Vec::new();
    for group in &groups {
        if !group.models.is_empty() {
            for model in &group.models {
                models.push(ModelInfo {
                    id: model.clone(),
                    object: "model".to_string(),
                    created: 0,
                    owned_by: group.id.clone(),
                });
            }
        } else if let Some(provider) = state
            .registry
            .get(crate::state::family_registry_key(group.provider_family))
        {
            let key = match state.key_manager.next_key(&group.id).await {
                Ok(key) => key,
                Err(_) => continue,
            };
            let ctx = turnsapi_provider_core::DispatchContext {
                api_key: key.secret,
                base_url: group.base_url.clone(),
                model: String::new(),
                timeout_seconds: group.timeout_seconds,
                headers: group.headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            };
            if let Ok(upstream_models) = provider.list_models(&ctx).await {
                models.extend(upstream_models.data);
            }
        }

        for alias in group.model_aliases.keys() {
            models.push(ModelInfo {
                id: alias.clone(),
                object: "model".to_string(),
                created: 0,
                owned_by: group.id.clone(),
            });
        }
    }

    Json(ModelsResponse::new(models)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_pin_wins_over_query_pin() {
        let mut headers = HeaderMap::new();
        headers.insert(GROUP_HEADER, "from-header".parse().unwrap());
        let query = ProviderGroupQuery {
            provider_group: Some("from-query".to_string()),
        };
        assert_eq!(pinned_group_id(&headers, &query).as_deref(), Some("from-header"));
    }

    #[test]
    fn query_pin_is_used_when_header_is_absent() {
        let headers = HeaderMap::new();
        let query = ProviderGroupQuery {
            provider_group: Some("from-query".to_string()),
        };
        assert_eq!(pinned_group_id(&headers, &query).as_deref(), Some("from-query"));
    }

    #[test]
    fn no_pin_when_neither_is_set() {
        let headers = HeaderMap::new();
        let query = ProviderGroupQuery::default();
        assert_eq!(pinned_group_id(&headers, &query), None);
    }
}
