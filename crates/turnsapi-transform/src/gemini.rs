//! Canonical chat-completions shape ⇄ Google Gemini `generateContent` (spec §4.1).

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use turnsapi_protocol::canonical::{
    ChatChoice, ChatCompletionChunk, ChatRequest, ChatResponse, Content, ContentPart, FinishReason,
    Role, ResponseMessage, StreamChoice, StreamDelta, Usage,
};
use turnsapi_protocol::gemini::{
    self, Candidate, GenerateContentRequest, GenerateContentResponse, GenerationConfig, InlineData,
    Part, ThinkingConfig,
};

const DEFAULT_TEMPERATURE: f64 = 1.0;

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Parses a `data:<mime>;base64,<data>` URL. Remote URLs are rejected —
/// Gemini's inline-data parts require base64 payloads.
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let mime = header.strip_suffix(";base64")?;
    const ALLOWED: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];
    if !ALLOWED.contains(&mime) {
        return None;
    }
    // Validate the payload decodes; callers forward the original string.
    BASE64.decode(data).ok()?;
    Some((mime.to_string(), data.to_string()))
}

fn message_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "model",
        _ => "user",
    }
}

fn content_to_parts(content: &Content) -> Vec<Part> {
    match content {
        Content::Text(text) => vec![Part::Text {
            text: text.clone(),
            thought: None,
        }],
        Content::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(Part::Text {
                    text: text.clone(),
                    thought: None,
                }),
                ContentPart::ImageUrl { image_url } => {
                    let (mime_type, data) = parse_data_url(&image_url.url)?;
                    Some(Part::InlineData {
                        inline_data: InlineData { mime_type, data },
                    })
                }
            })
            .collect(),
    }
}

/// `system` messages are folded into the first user turn; role `assistant`
/// maps to `model`. `include_thoughts` is the caller's choice: `false` for
/// the canonical path, `true` for the provider-native passthrough path.
pub fn to_gemini_request(req: &ChatRequest, include_thoughts: bool) -> GenerateContentRequest {
    let mut system_prefix = String::new();
    let mut contents: Vec<gemini::Content> = Vec::new();

    for message in &req.messages {
        if message.role == Role::System {
            if !system_prefix.is_empty() {
                system_prefix.push('\n');
            }
            system_prefix.push_str(&message.content.flatten_text());
            continue;
        }

        let mut parts = content_to_parts(&message.content);
        if contents.is_empty() && !system_prefix.is_empty() && message.role == Role::User {
            parts.insert(
                0,
                Part::Text {
                    text: std::mem::take(&mut system_prefix),
                    thought: None,
                },
            );
        }
        contents.push(gemini::Content {
            role: message_role(message.role).to_string(),
            parts,
        });
    }

    GenerateContentRequest {
        contents,
        generation_config: Some(GenerationConfig {
            temperature: Some(req.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
            max_output_tokens: req.max_tokens,
            top_p: req.top_p,
            stop_sequences: match &req.stop {
                Some(turnsapi_protocol::canonical::StopSequences::One(s)) => Some(vec![s.clone()]),
                Some(turnsapi_protocol::canonical::StopSequences::Many(v)) => Some(v.clone()),
                None => None,
            },
            thinking_config: Some(ThinkingConfig {
                include_thoughts,
            }),
        }),
    }
}

fn candidate_text(candidate: &Candidate, include_thoughts: bool) -> String {
    candidate
        .content
        .as_ref()
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| match part {
                    Part::Text { text, thought } => {
                        if !include_thoughts && thought.unwrap_or(false) {
                            None
                        } else {
                            Some(text.as_str())
                        }
                    }
                    Part::InlineData { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn finish_reason_from_gemini(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") => FinishReason::ContentFilter,
        _ => FinishReason::Stop,
    }
}

pub fn from_gemini_response(resp: &GenerateContentResponse, model: &str, id: &str) -> ChatResponse {
    let candidate = resp.candidates.first();
    let text = candidate
        .map(|c| candidate_text(c, false))
        .unwrap_or_default();
    let finish_reason = finish_reason_from_gemini(
        candidate.and_then(|c| c.finish_reason.as_deref()),
    );
    let usage = resp.usage_metadata.clone().unwrap_or_default();

    ChatResponse {
        id: id.to_string(),
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
            finish_reason,
        }],
        usage: Usage {
            prompt_tokens: usage.prompt_token_count,
            completion_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        },
    }
}

fn chunk_frame(chunk: &ChatCompletionChunk) -> Vec<u8> {
    let json = serde_json::to_string(chunk).unwrap_or_default();
    format!("data: {json}\n\n").into_bytes()
}

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Translates one streamed Gemini chunk into zero or one canonical SSE
/// frame, filtering thought-tagged parts unless `include_thoughts` is set.
pub fn translate_stream_chunk(
    resp: &GenerateContentResponse,
    chunk_id: &str,
    model: &str,
    include_thoughts: bool,
) -> Option<Vec<u8>> {
    let candidate = resp.candidates.first()?;
    let text = candidate_text(candidate, include_thoughts);
    if text.is_empty() {
        return None;
    }
    Some(chunk_frame(&ChatCompletionChunk {
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
    }))
}

pub fn terminal_frames(chunk_id: &str, model: &str) -> Vec<Vec<u8>> {
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

#[cfg(test)]
mod tests {
    use super::*;
    use turnsapi_protocol::canonical::Message;

    #[test]
    fn system_message_folds_into_first_user_turn() {
        let req = ChatRequest {
            model: "gemini-1.5-pro".to_string(),
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
        let gem_req = to_gemini_request(&req, false);
        assert_eq!(gem_req.contents.len(), 1);
        assert_eq!(gem_req.contents[0].role, "user");
        match &gem_req.contents[0].parts[0] {
            Part::Text { text, .. } => assert_eq!(text, "be terse"),
            _ => panic!("expected text part"),
        }
        assert_eq!(
            gem_req.generation_config.unwrap().temperature,
            Some(DEFAULT_TEMPERATURE)
        );
    }

    #[test]
    fn remote_image_urls_are_rejected() {
        assert!(parse_data_url("https://example.com/cat.png").is_none());
    }

    #[test]
    fn data_url_roundtrips_mime_and_payload() {
        let encoded = BASE64.encode(b"fake-bytes");
        let url = format!("data:image/png;base64,{encoded}");
        let (mime, data) = parse_data_url(&url).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(data, encoded);
    }

    #[test]
    fn thought_parts_are_filtered_from_the_canonical_stream() {
        let resp = GenerateContentResponse {
            candidates: vec![Candidate {
                content: Some(gemini::Content {
                    role: "model".to_string(),
                    parts: vec![
                        Part::Text {
                            text: "thinking...".to_string(),
                            thought: Some(true),
                        },
                        Part::Text {
                            text: "final answer".to_string(),
                            thought: None,
                        },
                    ],
                }),
                finish_reason: None,
            }],
            usage_metadata: None,
        };
        let frame = translate_stream_chunk(&resp, "chunk-1", "gemini-1.5-pro", false).unwrap();
        let text = String::from_utf8_lossy(&frame);
        assert!(text.contains("final answer"));
        assert!(!text.contains("thinking..."));
    }
}
