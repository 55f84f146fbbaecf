//! Shared reqwest client and upstream-error classification (spec §4.1, §7).

use std::sync::OnceLock;

use turnsapi_provider_core::ProviderError;

static SHARED_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

pub(crate) fn shared_client() -> reqwest::Client {
    SHARED_CLIENT
        .get_or_init(|| {
            reqwest::Client::builder()
                .build()
                .expect("default reqwest client config is always valid")
        })
        .clone()
}

pub(crate) fn map_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::Connection(err.to_string())
    } else {
        ProviderError::Other(err.to_string())
    }
}

/// Classifies a non-2xx upstream response per the error taxonomy.
pub(crate) async fn map_error_response(resp: reqwest::Response) -> ProviderError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    match status {
        401 | 403 => ProviderError::Auth(body),
        429 => ProviderError::Quota(body),
        400..=499 => ProviderError::UpstreamClient { status, body },
        _ => ProviderError::UpstreamServer { status, body },
    }
}
