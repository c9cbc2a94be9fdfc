//! Anthropic Messages API over SSE.
//!
//! Each request carries the full in-turn transcript plus a freshly rendered
//! system prompt. The prompt embeds the working-memory document, which is
//! replaced on every sync, so no prompt-cache breakpoints are set.

pub mod api;
mod sse;
pub(crate) mod types;

pub use api::{AnthropicClient, AnthropicConfig, DEFAULT_BASE_URL};
pub use sse::{SseParser, decode_event};
