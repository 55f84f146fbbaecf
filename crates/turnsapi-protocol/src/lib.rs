pub mod anthropic;
pub mod canonical;
pub mod gemini;
pub mod sse;

pub use sse::{SseEvent, SseParser};
