//! Reassembles a provider event stream into complete content blocks.
//!
//! Deltas are buffered per block and nothing business-visible leaves the
//! aggregator until the block's `BlockStop`. Display consumers get the
//! deltas through an optional [`EventSender`] as they arrive.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures_util::{Stream, StreamExt};
use serde_json::Value;

use super::agent::EventSender;
use super::events::AgentEvent;
use crate::providers::{
    BlockKind, ChatContentBlock, ProviderError, ProviderResult, ReasoningBlock, StreamEvent, Usage,
};

/// Arguments of a tool-use block after the single finalize step.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolArguments {
    Parsed(Value),
    /// The concatenated fragments were not valid JSON.
    Malformed { raw: String, error: String },
}

impl ToolArguments {
    fn from_fragments(raw: String) -> Self {
        if raw.trim().is_empty() {
            return ToolArguments::Parsed(Value::Object(serde_json::Map::new()));
        }
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => ToolArguments::Parsed(value),
            Err(err) => ToolArguments::Malformed {
                raw,
                error: err.to_string(),
            },
        }
    }

    /// Value replayed to the API and shown to display consumers.
    pub fn as_value(&self) -> Value {
        match self {
            ToolArguments::Parsed(value) => value.clone(),
            ToolArguments::Malformed { raw, .. } => Value::String(raw.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub arguments: ToolArguments,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text { text: String },
    ToolUse(ToolUseBlock),
    Thinking { text: String, signature: String },
}

impl ContentBlock {
    /// Converts the block into transcript form.
    ///
    /// Malformed tool arguments are replayed as `{"_raw_malformed": ...}` so
    /// the request stays valid and the model sees what it sent.
    pub fn to_chat_block(&self) -> ChatContentBlock {
        match self {
            ContentBlock::Text { text } => ChatContentBlock::Text(text.clone()),
            ContentBlock::Thinking { text, signature } => {
                ChatContentBlock::Reasoning(ReasoningBlock {
                    text: text.clone(),
                    signature: signature.clone(),
                })
            }
            ContentBlock::ToolUse(tool) => ChatContentBlock::ToolUse {
                id: tool.id.clone(),
                name: tool.name.clone(),
                input: match &tool.arguments {
                    ToolArguments::Parsed(value) => value.clone(),
                    ToolArguments::Malformed { raw, .. } => {
                        serde_json::json!({ "_raw_malformed": raw })
                    }
                },
            },
        }
    }
}

/// What the stream reported besides its blocks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    /// Usage of this request alone.
    pub usage: Usage,
    /// `MessageStop` was seen.
    pub completed: bool,
}

#[derive(Debug)]
enum Pending {
    Text(String),
    Thinking { text: String, signature: String },
    ToolUse { id: String, name: String, json: String },
}

#[derive(Debug)]
struct OpenBlock {
    index: usize,
    pending: Pending,
}

impl OpenBlock {
    fn kind(&self) -> BlockKind {
        match self.pending {
            Pending::Text(_) => BlockKind::Text,
            Pending::Thinking { .. } => BlockKind::Thinking,
            Pending::ToolUse { .. } => BlockKind::ToolUse,
        }
    }
}

/// Stream adapter from [`StreamEvent`]s to [`ContentBlock`]s.
///
/// Yields one block per start/stop pair, in stop order. An upstream error or
/// an `Error` event yields one `Err` and ends the sequence. Once it has
/// returned `None` it keeps returning `None`.
pub struct BlockAggregator<S> {
    upstream: S,
    open: Option<OpenBlock>,
    summary: StreamSummary,
    events: Option<EventSender>,
    /// Usage from earlier requests of the same turn, added to `UsageUpdate`s.
    usage_offset: Usage,
    finished: bool,
}

impl<S> BlockAggregator<S>
where
    S: Stream<Item = ProviderResult<StreamEvent>> + Unpin,
{
    pub fn new(upstream: S) -> Self {
        Self {
            upstream,
            open: None,
            summary: StreamSummary::default(),
            events: None,
            usage_offset: Usage::default(),
            finished: false,
        }
    }

    #[must_use]
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn with_usage_offset(mut self, usage: Usage) -> Self {
        self.usage_offset = usage;
        self
    }

    /// Stop reason and usage; complete once the stream has ended.
    pub fn summary(&self) -> &StreamSummary {
        &self.summary
    }

    fn emit(&self, event: AgentEvent) {
        if let Some(events) = &self.events {
            events.send_delta(event);
        }
    }

    fn emit_usage(&self) {
        let mut usage = self.usage_offset;
        usage.accumulate(self.summary.usage);
        self.emit(AgentEvent::UsageUpdate { usage });
    }

    /// Applies one event; returns an item when a block closes or on error.
    fn apply(&mut self, event: StreamEvent) -> Option<ProviderResult<ContentBlock>> {
        match event {
            StreamEvent::MessageStart { model, usage } => {
                self.summary.model = Some(model);
                self.summary.usage.absorb(usage);
                self.emit_usage();
            }
            StreamEvent::BlockStart {
                index,
                kind,
                id,
                name,
            } => self.open_block(index, kind, id, name),
            StreamEvent::TextDelta { index, text } => {
                if let Some(Pending::Text(buf)) = self.pending_at(index, BlockKind::Text) {
                    buf.push_str(&text);
                    self.emit(AgentEvent::AssistantDelta { text });
                }
            }
            StreamEvent::ThinkingDelta { index, thinking } => {
                if let Some(Pending::Thinking { text, .. }) =
                    self.pending_at(index, BlockKind::Thinking)
                {
                    text.push_str(&thinking);
                    self.emit(AgentEvent::ReasoningDelta { text: thinking });
                }
            }
            StreamEvent::SignatureDelta { index, signature } => {
                if let Some(Pending::Thinking { signature: sig, .. }) =
                    self.pending_at(index, BlockKind::Thinking)
                {
                    sig.push_str(&signature);
                }
            }
            StreamEvent::ToolInputDelta {
                index,
                partial_json,
            } => {
                if let Some(Pending::ToolUse { id, json, .. }) =
                    self.pending_at(index, BlockKind::ToolUse)
                {
                    json.push_str(&partial_json);
                    let id = id.clone();
                    self.emit(AgentEvent::ToolInputDelta {
                        id,
                        delta: partial_json,
                    });
                }
            }
            StreamEvent::BlockStop { index } => {
                return self.close_block(index).map(Ok);
            }
            StreamEvent::MessageDelta { stop_reason, usage } => {
                if stop_reason.is_some() {
                    self.summary.stop_reason = stop_reason;
                }
                if let Some(usage) = usage {
                    self.summary.usage.absorb(usage);
                    self.emit_usage();
                }
            }
            StreamEvent::MessageStop => {
                if let Some(open) = self.open.take() {
                    tracing::warn!(index = open.index, "message stopped with an open block; discarding it");
                }
                self.summary.completed = true;
                self.finished = true;
            }
            StreamEvent::Ping => {}
            StreamEvent::Error {
                error_type,
                message,
            } => {
                self.finished = true;
                return Some(Err(ProviderError::api_error(&error_type, &message)));
            }
        }
        None
    }

    fn open_block(
        &mut self,
        index: usize,
        kind: BlockKind,
        id: Option<String>,
        name: Option<String>,
    ) {
        if let Some(previous) = self.open.take() {
            tracing::warn!(
                index = previous.index,
                next = index,
                "block started before the previous one stopped; discarding it"
            );
        }
        let pending = match kind {
            BlockKind::Text => Pending::Text(String::new()),
            BlockKind::Thinking => Pending::Thinking {
                text: String::new(),
                signature: String::new(),
            },
            BlockKind::ToolUse => {
                let id = id.unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                let name = name.unwrap_or_default();
                self.emit(AgentEvent::ToolRequested {
                    id: id.clone(),
                    name: name.clone(),
                });
                Pending::ToolUse {
                    id,
                    name,
                    json: String::new(),
                }
            }
        };
        self.open = Some(OpenBlock { index, pending });
    }

    fn pending_at(&mut self, index: usize, kind: BlockKind) -> Option<&mut Pending> {
        match &mut self.open {
            Some(open) if open.index == index && open.kind() == kind => Some(&mut open.pending),
            _ => {
                tracing::debug!(index, ?kind, "delta does not match the open block; ignored");
                None
            }
        }
    }

    fn close_block(&mut self, index: usize) -> Option<ContentBlock> {
        let open = match self.open.take() {
            Some(open) if open.index == index => open,
            other => {
                tracing::debug!(index, "stop for a block that is not open; ignored");
                self.open = other;
                return None;
            }
        };

        let block = match open.pending {
            Pending::Text(text) => {
                self.emit(AgentEvent::AssistantCompleted { text: text.clone() });
                ContentBlock::Text { text }
            }
            Pending::Thinking { text, signature } => {
                self.emit(AgentEvent::ReasoningCompleted { text: text.clone() });
                ContentBlock::Thinking { text, signature }
            }
            Pending::ToolUse { id, name, json } => {
                let arguments = ToolArguments::from_fragments(json);
                self.emit(AgentEvent::ToolInputCompleted {
                    id: id.clone(),
                    name: name.clone(),
                    input: arguments.as_value(),
                });
                ContentBlock::ToolUse(ToolUseBlock {
                    id,
                    name,
                    arguments,
                })
            }
        };
        Some(block)
    }
}

impl<S> Stream for BlockAggregator<S>
where
    S: Stream<Item = ProviderResult<StreamEvent>> + Unpin,
{
    type Item = ProviderResult<ContentBlock>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(None);
            }
            match ready!(this.upstream.poll_next_unpin(cx)) {
                Some(Ok(event)) => {
                    if let Some(item) = this.apply(event) {
                        return Poll::Ready(Some(item));
                    }
                }
                Some(Err(err)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(err)));
                }
                None => {
                    if let Some(open) = this.open.take() {
                        tracing::warn!(index = open.index, "stream ended inside a block; discarding it");
                    }
                    tracing::warn!("stream ended without message_stop");
                    this.finished = true;
                    return Poll::Ready(None);
                }
            }
        }
    }
}
