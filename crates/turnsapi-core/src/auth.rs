//! Proxy-key authenticator (C6, spec §4.6).

use axum::http::HeaderMap;
use turnsapi_storage::ProxyKey;

use crate::error::ProxyError;
use crate::state::AppState;

/// Fixed tag every issued proxy key begins with (spec §6: "ASCII string
/// beginning with a fixed prefix, followed by 64 hex characters").
pub const PROXY_KEY_PREFIX: &str = "sk-turns-";

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::trim)
}

/// Authenticates the inbound request and returns the matched proxy key.
/// Usage accounting (`last_used_at`, `usage_count`) is bumped asynchronously
/// so it never delays the response.
pub async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<ProxyKey, ProxyError> {
    let token = extract_bearer(headers).ok_or_else(ProxyError::missing_auth)?;
    if !token.starts_with(PROXY_KEY_PREFIX) {
        return Err(ProxyError::invalid_auth());
    }

    let key = state
        .proxy_key_by_secret(token)
        .await
        .map_err(|err| ProxyError::internal(err.to_string()))?
        .ok_or_else(ProxyError::invalid_auth)?;

    if !key.is_active {
        return Err(ProxyError::inactive_key());
    }

    let storage = state.storage.clone();
    let key_id = key.id;
    tokio::spawn(async move {
        if let Err(err) = storage.update_proxy_key_last_used(key_id).await {
            tracing::warn!(error = %err, key_id, "failed to record proxy key last_used_at");
        }
        if let Err(err) = storage.update_proxy_key_usage(key_id).await {
            tracing::warn!(error = %err, key_id, "failed to bump proxy key usage_count");
        }
    });

    Ok(key)
}
