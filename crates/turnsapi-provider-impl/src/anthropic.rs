//! Anthropic Messages API adapter (spec §4.1).

use async_trait::async_trait;
use futures_util::StreamExt;

use turnsapi_protocol::canonical::{ChatRequest, ChatResponse, ModelsResponse, ModelInfo};
use turnsapi_protocol::sse::SseParser;
use turnsapi_provider_core::{ChunkStream, DispatchContext, Provider, ProviderResult};
use turnsapi_transform::anthropic::{from_anthropic_response, to_anthropic_request, translate_stream_event};

use crate::http::{map_error_response, map_transport_error, shared_client};
use crate::streaming::{error_stream, passthrough_stream};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider;

impl AnthropicProvider {
    pub fn new() -> Self {
        Self
    }

    fn messages_url(&self, ctx: &DispatchContext) -> String {
        let base = if ctx.base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            ctx.base_url.trim_end_matches('/')
        };
        format!("{base}/v1/messages")
    }

    fn request_builder(&self, ctx: &DispatchContext) -> reqwest::RequestBuilder {
        let mut builder = shared_client()
            .post(self.messages_url(ctx))
            .timeout(std::time::Duration::from_secs(ctx.timeout_seconds))
            .header("x-api-key", &ctx.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        for (name, value) in &ctx.headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

impl Default for AnthropicProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn family(&self) -> &'static str {
        "anthropic"
    }

    async fn chat(&self, ctx: &DispatchContext, req: &ChatRequest) -> ProviderResult<ChatResponse> {
        let mut body = to_anthropic_request(req);
        body.stream = Some(false);

        let resp = self
            .request_builder(ctx)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        let parsed = resp
            .json::<turnsapi_protocol::anthropic::MessagesResponse>()
            .await
            .map_err(map_transport_error)?;
        Ok(from_anthropic_response(&parsed, &req.model))
    }

    async fn chat_stream(&self, ctx: &DispatchContext, req: &ChatRequest) -> ProviderResult<ChunkStream> {
        let mut body = to_anthropic_request(req);
        body.stream = Some(true);

        let resp = self
            .request_builder(ctx)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !resp.status().is_success() {
            return Ok(error_stream(map_error_response(resp).await));
        }

        let chunk_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
        let model = req.model.clone();
        let mut upstream = resp.bytes_stream();
        let mut parser = SseParser::new();

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
                    for frame in translate_stream_event(&event, &chunk_id, &model) {
                        yield Ok(frame);
                    }
                }
            }
            for event in parser.finish() {
                for frame in translate_stream_event(&event, &chunk_id, &model) {
                    yield Ok(frame);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn chat_stream_native(&self, ctx: &DispatchContext, req: &ChatRequest) -> ProviderResult<ChunkStream> {
        let mut body = to_anthropic_request(req);
        body.stream = Some(true);

        let resp = self
            .request_builder(ctx)
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(passthrough_stream(resp))
    }

    async fn list_models(&self, _ctx: &DispatchContext) -> ProviderResult<ModelsResponse> {
        // Anthropic has no public models-list endpoint for classic API keys;
        // a static, periodically-updated roster stands in.
        let data = [
            "claude-3-5-sonnet-20241022",
            "claude-3-5-haiku-20241022",
            "claude-3-opus-20240229",
            "claude-3-sonnet-20240229",
            "claude-3-haiku-20240307",
        ]
        .into_iter()
        .map(|id| ModelInfo {
            id: id.to_string(),
            object: "model".to_string(),
            created: 0,
            owned_by: "anthropic".to_string(),
        })
        .collect();
        Ok(ModelsResponse::new(data))
    }

    async fn health_check(&self, ctx: &DispatchContext) -> ProviderResult<()> {
        let resp = self
            .request_builder(ctx)
            .json(&serde_json::json!({
                "model": ctx.model,
                "max_tokens": 1,
                "messages": [{"role": "user", "content": "ping"}],
            }))
            .send()
            .await
            .map_err(map_transport_error)?;
        if resp.status().is_success() || resp.status().as_u16() == 400 {
            // A 400 here still proves the key and endpoint are reachable;
            // the one-token ping request can itself be rejected as too short.
            return Ok(());
        }
        Err(map_error_response(resp).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(base_url: &str) -> DispatchContext {
        DispatchContext {
            api_key: "sk-ant".to_string(),
            base_url: base_url.to_string(),
            model: "claude-3-opus".to_string(),
            timeout_seconds: 30,
            headers: Vec::new(),
        }
    }

    #[test]
    fn messages_url_defaults_when_base_url_is_empty() {
        let provider = AnthropicProvider::new();
        assert_eq!(
            provider.messages_url(&ctx("")),
            "https://api.anthropic.com/v1/messages"
        );
    }

    #[test]
    fn messages_url_respects_a_configured_base_url() {
        let provider = AnthropicProvider::new();
        assert_eq!(
            provider.messages_url(&ctx("https://proxy.internal/anthropic/")),
            "https://proxy.internal/anthropic/v1/messages"
        );
    }

    #[tokio::test]
    async fn static_model_list_covers_the_current_claude_family() {
        let provider = AnthropicProvider::new();
        let models = provider.list_models(&ctx(DEFAULT_BASE_URL)).await.unwrap();
        assert!(!models.data.is_empty());
        assert!(models.data.iter().all(|m| m.id.starts_with("claude-")));
    }
}
