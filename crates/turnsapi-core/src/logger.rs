//! Request logger (C7, spec §4.7). Append-only; persistence failures here
//! are logged and swallowed per the §7 propagation policy.

use axum::http::HeaderMap;
use turnsapi_common::mask_key;
use turnsapi_protocol::canonical::ChatResponse;
use turnsapi_storage::NewRequestLog;

use crate::state::AppState;

/// Request/response bodies are truncated to this many bytes before storage;
/// streaming bodies arrive pre-truncated by the C8 pipeline's own 5 KB
/// prefix + 10-chunk tail rule.
const MAX_STORED_BODY_BYTES: usize = 8 * 1024;

pub struct LogInput {
    pub proxy_key_name: String,
    pub proxy_key_id: i64,
    pub group_id: String,
    pub upstream_key: String,
    pub model: String,
    pub request_body: String,
    pub response_body: Option<String>,
    pub status_code: i32,
    pub is_stream: bool,
    pub duration_ms: i64,
    pub tokens_used: i64,
    pub tokens_estimated: bool,
    pub error: Option<String>,
    pub client_ip: String,
    pub has_tool_calls: bool,
    pub tool_calls_count: i32,
    pub tool_names: Option<String>,
}

pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_STORED_BODY_BYTES {
        return body.to_string();
    }
    let mut end = MAX_STORED_BODY_BYTES;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Prefers `X-Forwarded-For`'s first hop, then `X-Real-IP`, then the raw
/// socket peer address.
pub fn client_ip(headers: &HeaderMap, socket_peer: Option<&str>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    socket_peer.unwrap_or("unknown").to_string()
}

/// Extracts `(has_tool_calls, tool_calls_count, tool_names)` from a
/// canonical chat response for the log row's denormalized tool columns.
pub fn tool_call_summary(response: &ChatResponse) -> (bool, i32, Option<String>) {
    let names: Vec<String> = response
        .choices
        .iter()
        .filter_map(|choice| choice.message.tool_calls.as_ref())
        .flatten()
        .map(|call| call.function.name.clone())
        .collect();
    if names.is_empty() {
        (false, 0, None)
    } else {
        let count = names.len() as i32;
        (true, count, Some(names.join(",")))
    }
}

pub async fn log_request(state: &AppState, input: LogInput) {
    let log = NewRequestLog {
        proxy_key_name: input.proxy_key_name,
        proxy_key_id: input.proxy_key_id,
        provider_group: input.group_id,
        openrouter_key: mask_key(&input.upstream_key),
        model: input.model,
        request_body: truncate_body(&input.request_body),
        response_body: input.response_body.as_deref().map(truncate_body),
        status_code: input.status_code,
        is_stream: input.is_stream,
        duration: input.duration_ms,
        tokens_used: input.tokens_used,
        tokens_estimated: input.tokens_estimated,
        error: input.error,
        client_ip: input.client_ip,
        has_tool_calls: input.has_tool_calls,
        tool_calls_count: input.tool_calls_count,
        tool_names: input.tool_names,
    };
    if let Err(err) = state.storage.insert_request_log(&log).await {
        tracing::warn!(error = %err, "failed to persist request log");
    }
}

/// Daily retention sweep (spec §4.7); `days <= 0` disables it entirely.
pub async fn run_retention_sweep(state: &AppState, days: i64) {
    if days <= 0 {
        return;
    }
    match state.storage.cleanup_logs_older_than(days as u32).await {
        Ok(deleted) => {
            if deleted > 0 {
                tracing::info!(deleted, "swept expired request logs");
            }
        }
        Err(err) => tracing::warn!(error = %err, "request log retention sweep failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_long_bodies_to_the_byte_cap() {
        let body = "a".repeat(MAX_STORED_BODY_BYTES + 100);
        let truncated = truncate_body(&body);
        assert_eq!(truncated.len(), MAX_STORED_BODY_BYTES);
    }

    #[test]
    fn short_bodies_pass_through_unchanged() {
        assert_eq!(truncate_body("hello"), "hello");
    }

    #[test]
    fn client_ip_prefers_forwarded_for_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, Some("127.0.0.1")), "203.0.113.7");
    }

    #[test]
    fn client_ip_falls_back_to_socket_peer() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some("192.0.2.5")), "192.0.2.5");
    }
}
