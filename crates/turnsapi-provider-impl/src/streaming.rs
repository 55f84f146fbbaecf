//! Streaming helpers shared by the provider adapters (spec C8).

use futures_util::StreamExt;
use turnsapi_provider_core::{ChunkStream, ProviderError};

use crate::http::map_transport_error;

/// Forwards an upstream byte stream unchanged. Used for provider-native
/// passthrough and for OpenAI/Azure, whose wire shape already matches the
/// canonical SSE framing.
pub(crate) fn passthrough_stream(resp: reqwest::Response) -> ChunkStream {
    Box::pin(resp.bytes_stream().map(|chunk| {
        chunk
            .map(|bytes| bytes.to_vec())
            .map_err(map_transport_error)
    }))
}

pub(crate) fn error_stream(err: ProviderError) -> ChunkStream {
    Box::pin(futures_util::stream::once(async move { Err(err) }))
}
