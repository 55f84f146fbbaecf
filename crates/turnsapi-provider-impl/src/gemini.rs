//! Google Gemini adapter (spec §4.1), including the component-local quota
//! manager that tracks 429/quota errors per key and backs off the router
//! away from a key that is visibly being throttled.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;

use turnsapi_protocol::canonical::{ChatRequest, ChatResponse, ModelInfo, ModelsResponse};
use turnsapi_protocol::gemini::GenerateContentResponse;
use turnsapi_provider_core::{ChunkStream, DispatchContext, Provider, ProviderError, ProviderResult};
use turnsapi_transform::gemini::{from_gemini_response, terminal_frames, to_gemini_request, translate_stream_chunk};

use crate::http::{map_error_response, map_transport_error, shared_client};
use crate::streaming::{error_stream, passthrough_stream};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const BASE_BACKOFF: Duration = Duration::from_secs(60);
const MAX_BACKOFF: Duration = Duration::from_secs(30 * 60);

struct QuotaState {
    count: u32,
    last_quota_error: Instant,
}

/// Tracks 429/quota errors per upstream key. `count × 1 min` backoff, capped
/// at 30 min; any success resets the entry.
struct QuotaManager {
    entries: Mutex<HashMap<String, QuotaState>>,
}

impl QuotaManager {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn should_skip_request(&self, key: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(state) => {
                let backoff = BASE_BACKOFF.saturating_mul(state.count).min(MAX_BACKOFF);
                state.last_quota_error.elapsed() < backoff
            }
            None => false,
        }
    }

    fn record_quota_error(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap();
        let state = entries.entry(key.to_string()).or_insert(QuotaState {
            count: 0,
            last_quota_error: Instant::now(),
        });
        state.count += 1;
        state.last_quota_error = Instant::now();
    }

    fn record_success(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

pub struct GeminiProvider {
    quota: QuotaManager,
}

impl GeminiProvider {
    pub fn new() -> Self {
        Self {
            quota: QuotaManager::new(),
        }
    }

    fn generate_url(&self, ctx: &DispatchContext, streaming: bool) -> String {
        let base = if ctx.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            ctx.base_url.trim_end_matches('/')
        };
        let op = if streaming {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!("{base}/v1beta/models/{}:{}", ctx.model, op)
    }

    fn request_builder(&self, ctx: &DispatchContext, url: String) -> reqwest::RequestBuilder {
        let mut builder = shared_client()
            .post(url)
            .timeout(std::time::Duration::from_secs(ctx.timeout_seconds))
            .header("x-goog-api-key", &ctx.api_key);
        for (name, value) in &ctx.headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

impl Default for GeminiProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn family(&self) -> &'static str {
        "gemini"
    }

    async fn chat(&self, ctx: &DispatchContext, req: &ChatRequest) -> ProviderResult<ChatResponse> {
        if self.quota.should_skip_request(&ctx.api_key) {
            return Err(ProviderError::Quota(
                "gemini key is in quota backoff".to_string(),
            ));
        }

        let body = to_gemini_request(req, false);
        let resp = self
            .request_builder(ctx, self.generate_url(ctx, false))
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        if resp.status().as_u16() == 429 {
            self.quota.record_quota_error(&ctx.api_key);
            return Err(map_error_response(resp).await);
        }
        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }

        let parsed = resp
            .json::<GenerateContentResponse>()
            .await
            .map_err(map_transport_error)?;
        self.quota.record_success(&ctx.api_key);
        let id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
        Ok(from_gemini_response(&parsed, &req.model, &id))
    }

    async fn chat_stream(&self, ctx: &DispatchContext, req: &ChatRequest) -> ProviderResult<ChunkStream> {
        if self.quota.should_skip_request(&ctx.api_key) {
            return Ok(error_stream(ProviderError::Quota(
                "gemini key is in quota backoff".to_string(),
            )));
        }

        let body = to_gemini_request(req, false);
        let resp = self
            .request_builder(ctx, self.generate_url(ctx, true))
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        if resp.status().as_u16() == 429 {
            self.quota.record_quota_error(&ctx.api_key);
            return Ok(error_stream(map_error_response(resp).await));
        }
        if !resp.status().is_success() {
            return Ok(error_stream(map_error_response(resp).await));
        }
        self.quota.record_success(&ctx.api_key);

        let chunk_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
        let model = req.model.clone();
        let mut upstream = resp.bytes_stream();
        let mut parser = turnsapi_protocol::SseParser::new();

        let stream = async_stream::stream! {
            while let Some(chunk) = upstream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        yield Err(map_transport_error(err));
                        return;
                    }
                };
                for event in parser.push_bytes(&bytes) {
                    let Ok(parsed) = serde_json::from_str::<GenerateContentResponse>(&event.data) else {
                        continue;
                    };
                    if let Some(frame) = translate_stream_chunk(&parsed, &chunk_id, &model, false) {
                        yield Ok(frame);
                    }
                }
            }
            for frame in terminal_frames(&chunk_id, &model) {
                yield Ok(frame);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn chat_stream_native(&self, ctx: &DispatchContext, req: &ChatRequest) -> ProviderResult<ChunkStream> {
        if self.quota.should_skip_request(&ctx.api_key) {
            return Ok(error_stream(ProviderError::Quota(
                "gemini key is in quota backoff".to_string(),
            )));
        }

        let body = to_gemini_request(req, true);
        let resp = self
            .request_builder(ctx, self.generate_url(ctx, true))
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        if resp.status().as_u16() == 429 {
            self.quota.record_quota_error(&ctx.api_key);
            return Err(map_error_response(resp).await);
        }
        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        self.quota.record_success(&ctx.api_key);
        Ok(passthrough_stream(resp))
    }

    async fn list_models(&self, ctx: &DispatchContext) -> ProviderResult<ModelsResponse> {
        let base = if ctx.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            ctx.base_url.trim_end_matches('/')
        };
        let resp = shared_client()
            .get(format!("{base}/v1beta/models"))
            .timeout(std::time::Duration::from_secs(ctx.timeout_seconds))
            .header("x-goog-api-key", &ctx.api_key)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }

        #[derive(serde::Deserialize)]
        struct RawModel {
            name: String,
        }
        #[derive(serde::Deserialize)]
        struct RawModelsList {
            #[serde(default)]
            models: Vec<RawModel>,
        }

        let raw = resp
            .json::<RawModelsList>()
            .await
            .map_err(map_transport_error)?;
        let data = raw
            .models
            .into_iter()
            .map(|m| ModelInfo {
                id: m.name.trim_start_matches("models/").to_string(),
                object: "model".to_string(),
                created: 0,
                owned_by: "google".to_string(),
            })
            .collect();
        Ok(ModelsResponse::new(data))
    }

    async fn health_check(&self, ctx: &DispatchContext) -> ProviderResult<()> {
        self.list_models(ctx).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_consecutive_quota_errors_and_caps_at_thirty_minutes() {
        let quota = QuotaManager::new();
        quota.record_quota_error("key-1");
        assert!(quota.should_skip_request("key-1"));

        // Fast-forward past the 1-minute backoff by directly mutating state
        // is not possible through the public API, so we only assert the
        // monotonic cap invariant on the formula itself.
        let backoff_30 = BASE_BACKOFF.saturating_mul(30).min(MAX_BACKOFF);
        let backoff_60 = BASE_BACKOFF.saturating_mul(60).min(MAX_BACKOFF);
        assert_eq!(backoff_30, MAX_BACKOFF);
        assert_eq!(backoff_60, MAX_BACKOFF);
    }

    #[test]
    fn success_clears_an_unknown_or_tracked_key_without_panicking() {
        let quota = QuotaManager::new();
        quota.record_success("never-seen");
        quota.record_quota_error("key-2");
        quota.record_success("key-2");
        assert!(!quota.should_skip_request("key-2"));
    }

    #[test]
    fn generate_url_defaults_and_selects_streaming_operation() {
        let provider = GeminiProvider::new();
        let ctx = DispatchContext {
            api_key: "k".to_string(),
            base_url: String::new(),
            model: "gemini-1.5-pro".to_string(),
            timeout_seconds: 30,
            headers: Vec::new(),
        };
        assert_eq!(
            provider.generate_url(&ctx, false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-pro:generateContent"
        );
        assert!(provider.generate_url(&ctx, true).ends_with(":streamGenerateContent?alt=sse"));
    }
}
