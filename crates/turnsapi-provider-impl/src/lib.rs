//! Concrete upstream provider adapters: OpenAI, Azure OpenAI, Anthropic,
//! and Gemini. Each implements `turnsapi_provider_core::Provider` and owns
//! its own HTTP dispatch; translation to/from the canonical chat shape is
//! delegated to `turnsapi-transform` where the wire format differs.

mod anthropic;
mod gemini;
mod http;
mod openai;
mod streaming;

use std::sync::Arc;

use turnsapi_provider_core::ProviderRegistry;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

/// Builds a registry with all four built-in provider families registered.
pub fn builtin_registry() -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(OpenAiProvider::openai()));
    registry.register(Arc::new(OpenAiProvider::azure()));
    registry.register(Arc::new(AnthropicProvider::new()));
    registry.register(Arc::new(GeminiProvider::new()));
    registry
}
