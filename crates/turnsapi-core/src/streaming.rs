//! Streaming pipeline (C8, spec §4.8): tee adapter chunks to the HTTP sink
//! while capturing a bounded buffer for logging and token extraction.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::oneshot;
use turnsapi_provider_core::{ChunkStream, StreamChunk};

const PREFIX_CAP_BYTES: usize = 5 * 1024;
const TAIL_LEN: usize = 10;

#[derive(Default)]
struct StreamCapture {
    prefix: Vec<u8>,
    tail: VecDeque<Vec<u8>>,
    received_any: bool,
}

impl StreamCapture {
    fn push(&mut self, chunk: &[u8]) {
        self.received_any = true;
        if self.prefix.len() < PREFIX_CAP_BYTES {
            let remaining = PREFIX_CAP_BYTES - self.prefix.len();
            let take = remaining.min(chunk.len());
            self.prefix.extend_from_slice(&chunk[..take]);
        }
        self.tail.push_back(chunk.to_vec());
        if self.tail.len() > TAIL_LEN {
            self.tail.pop_front();
        }
    }

    fn into_text(self) -> (bool, String) {
        let mut combined = self.prefix;
        for chunk in &self.tail {
            combined.extend_from_slice(chunk);
        }
        (self.received_any, String::from_utf8_lossy(&combined).into_owned())
    }
}

pub struct StreamOutcome {
    pub success: bool,
    pub captured_text: String,
}

/// Tees an adapter's chunk sequence: every chunk passes through to the
/// caller unmodified, while a bounded copy accumulates for C7. The outcome
/// is delivered once, either when the stream completes/errors or, if the
/// stream is dropped before that (client disconnect), on drop — charging
/// the attempt as failed per spec §5's cancellation rule.
struct TeeStream {
    inner: ChunkStream,
    capture: StreamCapture,
    done_tx: Option<oneshot::Sender<StreamOutcome>>,
}

impl TeeStream {
    fn finish(&mut self, forced_failure: bool) {
        let Some(tx) = self.done_tx.take() else {
            return;
        };
        let capture = std::mem::take(&mut self.capture);
        let (received_any, captured_text) = capture.into_text();
        let success = received_any && !forced_failure;
        let _ = tx.send(StreamOutcome {
            success,
            captured_text,
        });
    }
}

impl Stream for TeeStream {
    type Item = StreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.capture.push(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.finish(true);
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.finish(false);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TeeStream {
    fn drop(&mut self) {
        self.finish(true);
    }
}

/// Wraps `inner` for passthrough while capturing bytes; the returned
/// receiver resolves once with the captured text and a success/failure
/// verdict once the stream is fully drained or dropped.
pub fn tee(inner: ChunkStream) -> (ChunkStream, oneshot::Receiver<StreamOutcome>) {
    let (tx, rx) = oneshot::channel();
    let teed = TeeStream {
        inner,
        capture: StreamCapture::default(),
        done_tx: Some(tx),
    };
    (Box::pin(teed), rx)
}

/// Token extraction per spec §4.8: whole-buffer JSON `usage.total_tokens`
/// first, else a reverse scan of SSE `data:` frames for the first provider
/// whose usage shape matches. `(tokens, estimated)`; `estimated` is true
/// only when no usage payload was found at all (value defaults to 0).
pub fn extract_tokens(buffer: &str) -> (i64, bool) {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(buffer) {
        if let Some(total) = value.pointer("/usage/total_tokens").and_then(|v| v.as_i64()) {
            return (total, false);
        }
    }

    let frames: Vec<&str> = buffer
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|payload| !payload.is_empty() && *payload != "[DONE]")
        .collect();

    for payload in frames.iter().rev() {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
            continue;
        };
        if let Some(total) = value.pointer("/usage/total_tokens").and_then(|v| v.as_i64()) {
            return (total, false);
        }
        if let Some(total) = value
            .pointer("/usageMetadata/totalTokenCount")
            .and_then(|v| v.as_i64())
        {
            return (total, false);
        }
        if let (Some(input), Some(output)) = (
            value.pointer("/usage/input_tokens").and_then(|v| v.as_i64()),
            value.pointer("/usage/output_tokens").and_then(|v| v.as_i64()),
        ) {
            return (input + output, false);
        }
    }

    (0, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_total_tokens_from_a_plain_json_buffer() {
        let buffer = r#"{"usage":{"total_tokens":42}}"#;
        assert_eq!(extract_tokens(buffer), (42, false));
    }

    #[test]
    fn scans_sse_frames_in_reverse_for_openai_usage() {
        let buffer = "data: {\"choices\":[]}\n\ndata: {\"usage\":{\"total_tokens\":7}}\n\ndata: [DONE]\n\n";
        assert_eq!(extract_tokens(buffer), (7, false));
    }

    #[test]
    fn scans_sse_frames_for_gemini_usage_metadata() {
        let buffer = "data: {\"usageMetadata\":{\"totalTokenCount\":99}}\n\n";
        assert_eq!(extract_tokens(buffer), (99, false));
    }

    #[test]
    fn scans_sse_frames_for_anthropic_split_usage() {
        let buffer = "data: {\"usage\":{\"input_tokens\":3,\"output_tokens\":5}}\n\n";
        assert_eq!(extract_tokens(buffer), (8, false));
    }

    #[test]
    fn falls_back_to_zero_and_estimated_when_nothing_matches() {
        let buffer = "data: {\"choices\":[]}\n\n";
        assert_eq!(extract_tokens(buffer), (0, true));
    }
}
