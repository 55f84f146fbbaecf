//! OpenAI and Azure OpenAI adapters (spec §4.1). Both speak the canonical
//! wire shape directly — no request/response translation is needed, only
//! URL construction and the auth header, which differs between the two.

use async_trait::async_trait;

use turnsapi_protocol::canonical::{ChatRequest, ChatResponse, ModelsResponse};
use turnsapi_provider_core::{ChunkStream, DispatchContext, Provider, ProviderResult};

use crate::http::{map_error_response, map_transport_error, shared_client};
use crate::streaming::passthrough_stream;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStyle {
    /// `Authorization: Bearer <key>`
    Bearer,
    /// `api-key: <key>`, Azure's convention.
    ApiKeyHeader,
}

pub struct OpenAiProvider {
    family: &'static str,
    auth_style: AuthStyle,
}

impl OpenAiProvider {
    pub fn openai() -> Self {
        Self {
            family: "openai",
            auth_style: AuthStyle::Bearer,
        }
    }

    pub fn azure() -> Self {
        Self {
            family: "azure_openai",
            auth_style: AuthStyle::ApiKeyHeader,
        }
    }

    fn chat_completions_url(&self, ctx: &DispatchContext) -> String {
        let base = ctx.base_url.trim_end_matches('/');
        match self.auth_style {
            // Azure's base_url is the fully-qualified deployment endpoint
            // (including api-version query string) configured by the admin.
            AuthStyle::ApiKeyHeader => base.to_string(),
            AuthStyle::Bearer => {
                if base.ends_with("/v1") {
                    format!("{base}/chat/completions")
                } else {
                    format!("{base}/v1/chat/completions")
                }
            }
        }
    }

    fn models_url(&self, ctx: &DispatchContext) -> String {
        let base = ctx.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{base}/models")
        } else {
            format!("{base}/v1/models")
        }
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder, ctx: &DispatchContext) -> reqwest::RequestBuilder {
        match self.auth_style {
            AuthStyle::Bearer => builder.bearer_auth(&ctx.api_key),
            AuthStyle::ApiKeyHeader => builder.header("api-key", &ctx.api_key),
        }
    }

    fn apply_headers(&self, mut builder: reqwest::RequestBuilder, ctx: &DispatchContext) -> reqwest::RequestBuilder {
        for (name, value) in &ctx.headers {
            builder = builder.header(name, value);
        }
        builder
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn family(&self) -> &'static str {
        self.family
    }

    async fn chat(&self, ctx: &DispatchContext, req: &ChatRequest) -> ProviderResult<ChatResponse> {
        let client = shared_client();
        let mut body = req.clone();
        body.stream = Some(false);

        let builder = client
            .post(self.chat_completions_url(ctx))
            .timeout(std::time::Duration::from_secs(ctx.timeout_seconds));
        let builder = self.apply_auth(builder, ctx);
        let builder = self.apply_headers(builder, ctx);

        let resp = builder
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        resp.json::<ChatResponse>()
            .await
            .map_err(map_transport_error)
    }

    async fn chat_stream(&self, ctx: &DispatchContext, req: &ChatRequest) -> ProviderResult<ChunkStream> {
        self.chat_stream_native(ctx, req).await
    }

    async fn chat_stream_native(&self, ctx: &DispatchContext, req: &ChatRequest) -> ProviderResult<ChunkStream> {
        let client = shared_client();
        let mut body = req.clone();
        body.stream = Some(true);

        let builder = client
            .post(self.chat_completions_url(ctx))
            .timeout(std::time::Duration::from_secs(ctx.timeout_seconds));
        let builder = self.apply_auth(builder, ctx);
        let builder = self.apply_headers(builder, ctx);

        let resp = builder
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(passthrough_stream(resp))
    }

    async fn list_models(&self, ctx: &DispatchContext) -> ProviderResult<ModelsResponse> {
        let client = shared_client();
        let builder = client
            .get(self.models_url(ctx))
            .timeout(std::time::Duration::from_secs(ctx.timeout_seconds));
        let builder = self.apply_auth(builder, ctx);
        let builder = self.apply_headers(builder, ctx);

        let resp = builder.send().await.map_err(map_transport_error)?;
        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        resp.json::<ModelsResponse>()
            .await
            .map_err(map_transport_error)
    }

    async fn health_check(&self, ctx: &DispatchContext) -> ProviderResult<()> {
        self.list_models(ctx).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(base_url: &str) -> DispatchContext {
        DispatchContext {
            api_key: "sk-test".to_string(),
            base_url: base_url.to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_seconds: 30,
            headers: Vec::new(),
        }
    }

    #[test]
    fn azure_uses_base_url_verbatim_as_the_chat_endpoint() {
        let provider = OpenAiProvider::azure();
        let c = ctx("https://my-resource.openai.azure.com/openai/deployments/gpt4/chat/completions?api-version=2024-06-01");
        assert_eq!(provider.chat_completions_url(&c), c.base_url);
    }

    #[test]
    fn openai_appends_v1_chat_completions_when_missing() {
        let provider = OpenAiProvider::openai();
        let c = ctx(DEFAULT_OPENAI_BASE_URL);
        assert_eq!(
            provider.chat_completions_url(&c),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn openai_does_not_double_up_v1_when_base_url_already_has_it() {
        let provider = OpenAiProvider::openai();
        let c = ctx("https://api.openai.com/v1");
        assert_eq!(
            provider.chat_completions_url(&c),
            "https://api.openai.com/v1/chat/completions"
        );
    }
}
