//! Model stream clients.

pub mod anthropic;
pub mod shared;

use futures_util::future::BoxFuture;

pub use shared::{
    BlockKind, ChatContentBlock, ChatMessage, MessageContent, ProviderError, ProviderErrorKind,
    ProviderResult, ProviderStream, ReasoningBlock, StreamEvent, Usage, resolve_api_key,
    resolve_base_url,
};

use crate::tools::ToolDefinition;

/// A client that turns one structured request into a stream of events.
///
/// The agent loop only talks to this trait; tests plug in scripted streams.
pub trait ModelClient: Send + Sync {
    fn send_messages_stream<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        tools: &'a [ToolDefinition],
        system: Option<&'a str>,
    ) -> BoxFuture<'a, anyhow::Result<ProviderStream>>;
}
