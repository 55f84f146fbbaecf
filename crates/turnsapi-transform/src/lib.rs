//! Pure, synchronously-testable translation between the canonical chat
//! shape and each upstream provider's wire format. Nothing in this crate
//! performs I/O — adapters in `turnsapi-provider-impl` call into these
//! functions around their HTTP and streaming plumbing.

pub mod anthropic;
pub mod gemini;
