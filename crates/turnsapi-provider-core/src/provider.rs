//! The provider adapter capability set (spec §4.1).

use async_trait::async_trait;
use futures_core::Stream;
use std::pin::Pin;

use turnsapi_protocol::canonical::{ChatRequest, ChatResponse, ModelsResponse};

use crate::errors::ProviderResult;

/// One server-sent chunk, already framed as `data: ...\n\n` bytes and ready
/// to write to the HTTP response.
pub type StreamChunk = Result<Vec<u8>, ProviderError>;
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

pub use crate::errors::ProviderError;

/// A single configured upstream key plus the target model, resolved by the
/// router/orchestrator before dispatch.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub timeout_seconds: u64,
    pub headers: Vec<(String, String)>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn family(&self) -> &'static str;

    async fn chat(&self, ctx: &DispatchContext, req: &ChatRequest) -> ProviderResult<ChatResponse>;

    /// Canonical OpenAI-shaped SSE chunks.
    async fn chat_stream(
        &self,
        ctx: &DispatchContext,
        req: &ChatRequest,
    ) -> ProviderResult<ChunkStream>;

    /// Provider-native SSE chunks, used only for groups configured with
    /// `native_response = true`.
    async fn chat_stream_native(
        &self,
        ctx: &DispatchContext,
        req: &ChatRequest,
    ) -> ProviderResult<ChunkStream>;

    async fn list_models(&self, ctx: &DispatchContext) -> ProviderResult<ModelsResponse>;

    async fn health_check(&self, ctx: &DispatchContext) -> ProviderResult<()>;
}
