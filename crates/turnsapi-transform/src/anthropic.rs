//! Canonical chat-completions shape ⇄ Anthropic Messages API (spec §4.1).

use std::time::{SystemTime, UNIX_EPOCH};

use turnsapi_protocol::anthropic::{
    ContentBlock, Delta, MessageParam, MessagesRequest, MessagesResponse, StreamEvent,
};
use turnsapi_protocol::canonical::{
    ChatChoice, ChatCompletionChunk, ChatRequest, ChatResponse, FinishReason, Role,
    ResponseMessage, StreamChoice, StreamDelta, Usage,
};
use turnsapi_protocol::sse::SseEvent;

const DEFAULT_MAX_TOKENS: i64 = 4096;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// System messages are dropped — Anthropic has no system role at message
/// level — and multimodal content is flattened to plain text.
pub fn to_anthropic_request(req: &ChatRequest) -> MessagesRequest {
    let messages: Vec<MessageParam> = req
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| MessageParam {
            role: match m.role {
                Role::Assistant => "assistant".to_string(),
                Role::Tool => "user".to_string(),
                Role::User | Role::System => "user".to_string(),
            },
            content: m.content.flatten_text(),
        })
        .collect();

    MessagesRequest {
        model: req.model.clone(),
        messages,
        max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: req.temperature,
        top_p: req.top_p,
        stop_sequences: match &req.stop {
            Some(turnsapi_protocol::canonical::StopSequences::One(s)) => Some(vec![s.clone()]),
            Some(turnsapi_protocol::canonical::StopSequences::Many(v)) => Some(v.clone()),
            None => None,
        },
        stream: req.stream,
    }
}

fn finish_reason_from_stop_reason(stop_reason: Option<&str>) -> FinishReason {
    match stop_reason {
        Some("max_tokens") => FinishReason::Length,
        Some("tool_use") => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

/// Concatenates all text content blocks; totals are input + output tokens.
pub fn from_anthropic_response(resp: &MessagesResponse, model: &str) -> ChatResponse {
    let text = resp
        .content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            ContentBlock::Other => None,
        })
        .collect::<Vec<_>>()
        .join("");

    ChatResponse {
        id: resp.id.clone(),
        object: "chat.completion".to_string(),
        created: now_unix(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ResponseMessage {
                role: Role::Assistant,
                content: Some(text),
                tool_calls: None,
            },
            finish_reason: finish_reason_from_stop_reason(resp.stop_reason.as_deref()),
        }],
        usage: Usage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
            total_tokens: resp.usage.input_tokens + resp.usage.output_tokens,
        },
    }
}

fn chunk_frame(chunk: &ChatCompletionChunk) -> Vec<u8> {
    let json = serde_json::to_string(chunk).unwrap_or_default();
    format!("data: {json}\n\n").into_bytes()
}

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Translates one parsed Anthropic SSE event into zero or more canonical
/// OpenAI-shaped SSE frames. `content_block_delta` becomes a content delta
/// chunk; `message_stop` emits a terminal chunk followed by `[DONE]`.
pub fn translate_stream_event(event: &SseEvent, chunk_id: &str, model: &str) -> Vec<Vec<u8>> {
    let Ok(parsed) = serde_json::from_str::<StreamEvent>(&event.data) else {
        return Vec::new();
    };

    match parsed {
        StreamEvent::ContentBlockDelta {
            delta: Delta::TextDelta { text },
        } => vec![chunk_frame(&ChatCompletionChunk {
            id: chunk_id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: now_unix(),
            model: model.to_string(),
            choices: vec![StreamChoice {
                index: 0,
                delta: StreamDelta {
                    role: None,
                    content: Some(text),
                },
                finish_reason: None,
            }],
            usage: None,
        })],
        StreamEvent::MessageStop => {
            let terminal = chunk_frame(&ChatCompletionChunk {
                id: chunk_id.to_string(),
                object: "chat.completion.chunk".to_string(),
                created: now_unix(),
                model: model.to_string(),
                choices: vec![StreamChoice {
                    index: 0,
                    delta: StreamDelta::default(),
                    finish_reason: Some(FinishReason::Stop),
                }],
                usage: None,
            });
            vec![terminal, DONE_FRAME.to_vec()]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnsapi_protocol::canonical::{Content, Message};

    #[test]
    fn system_message_is_dropped_and_max_tokens_defaults() {
        let req = ChatRequest {
            model: "claude-3-opus".to_string(),
            messages: vec![
                Message {
                    role: Role::System,
                    content: Content::Text("be terse".to_string()),
                    name: None,
                    tool_call_id: None,
                    tool_calls: None,
                },
                Message {
                    role: Role::User,
                    content: Content::Text("hi".to_string()),
                    name: None,
                    tool_call_id: None,
                    tool_calls: None,
                },
            ],
            temperature: None,
            max_tokens: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
            stream: None,
        };
        let anthropic_req = to_anthropic_request(&req);
        assert_eq!(anthropic_req.messages.len(), 1);
        assert_eq!(anthropic_req.messages[0].role, "user");
        assert_eq!(anthropic_req.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn stream_events_produce_deltas_then_done() {
        let delta_event = SseEvent {
            event: Some("content_block_delta".to_string()),
            data: r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"he"}}"#
                .to_string(),
        };
        let frames = translate_stream_event(&delta_event, "chunk-1", "claude-3-opus");
        assert_eq!(frames.len(), 1);
        assert!(String::from_utf8_lossy(&frames[0]).contains("\"content\":\"he\""));

        let stop_event = SseEvent {
            event: Some("message_stop".to_string()),
            data: r#"{"type":"message_stop"}"#.to_string(),
        };
        let frames = translate_stream_event(&stop_event, "chunk-1", "claude-3-opus");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], DONE_FRAME);
    }

    #[test]
    fn response_totals_sum_input_and_output_tokens() {
        let resp = MessagesResponse {
            id: "msg_1".to_string(),
            content: vec![
                ContentBlock::Text {
                    text: "he".to_string(),
                },
                ContentBlock::Text {
                    text: "llo".to_string(),
                },
            ],
            stop_reason: Some("end_turn".to_string()),
            usage: turnsapi_protocol::anthropic::Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        };
        let canonical = from_anthropic_response(&resp, "claude-3-opus");
        assert_eq!(
            canonical.choices[0].message.content.as_deref(),
            Some("hello")
        );
        assert_eq!(canonical.usage.total_tokens, 15);
        assert_eq!(canonical.choices[0].finish_reason, FinishReason::Stop);
    }
}
