use std::pin::Pin;
use std::task::{Context, Poll};

use eventsource_stream::{EventStream, Eventsource};
use futures_util::Stream;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::providers::shared::{
    BlockKind, ProviderError, ProviderErrorKind, ProviderResult, StreamEvent, Usage,
};

/// Converts an HTTP body byte stream into `StreamEvent`s.
pub struct SseParser<S> {
    inner: EventStream<S>,
}

impl<S> SseParser<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
        }
    }
}

impl<S, E> Stream for SseParser<S>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = ProviderResult<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(decode_event(&event.event, &event.data))),
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(ProviderError::new(
                ProviderErrorKind::Parse,
                format!("SSE stream error: {e}"),
            )))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn payload<T: DeserializeOwned>(event_type: &str, data: &str) -> ProviderResult<T> {
    if data.trim().is_empty() {
        return Err(ProviderError::new(
            ProviderErrorKind::Parse,
            format!("Missing data for {event_type}"),
        ));
    }
    serde_json::from_str(data).map_err(|err| {
        ProviderError::new(
            ProviderErrorKind::Parse,
            format!("Failed to parse {event_type}: {err}"),
        )
    })
}

/// Maps one SSE frame (`event:` name plus `data:` body) to a `StreamEvent`.
///
/// # Errors
/// Returns a `Parse` error for unknown event/delta types or bad JSON.
pub fn decode_event(event_type: &str, data: &str) -> ProviderResult<StreamEvent> {
    match event_type {
        "ping" => Ok(StreamEvent::Ping),
        "message_stop" => Ok(StreamEvent::MessageStop),
        "message_start" => {
            let start: MessageStartFrame = payload(event_type, data)?;
            Ok(StreamEvent::MessageStart {
                model: start.message.model,
                usage: start.message.usage.into(),
            })
        }
        "content_block_start" => {
            let start: BlockStartFrame = payload(event_type, data)?;
            let kind = start
                .content_block
                .kind
                .parse::<BlockKind>()
                .map_err(|e| ProviderError::new(ProviderErrorKind::Parse, e))?;
            Ok(StreamEvent::BlockStart {
                index: start.index,
                kind,
                id: start.content_block.id,
                name: start.content_block.name,
            })
        }
        "content_block_delta" => {
            let frame: BlockDeltaFrame = payload(event_type, data)?;
            let index = frame.index;
            let delta = frame.delta;
            match delta.kind.as_str() {
                "text_delta" => Ok(StreamEvent::TextDelta {
                    index,
                    text: delta.text.unwrap_or_default(),
                }),
                "input_json_delta" => Ok(StreamEvent::ToolInputDelta {
                    index,
                    partial_json: delta.partial_json.unwrap_or_default(),
                }),
                "thinking_delta" => Ok(StreamEvent::ThinkingDelta {
                    index,
                    thinking: delta.thinking.unwrap_or_default(),
                }),
                "signature_delta" => Ok(StreamEvent::SignatureDelta {
                    index,
                    signature: delta.signature.unwrap_or_default(),
                }),
                other => Err(ProviderError::new(
                    ProviderErrorKind::Parse,
                    format!("Unknown delta type: {other}"),
                )),
            }
        }
        "content_block_stop" => {
            let stop: BlockStopFrame = payload(event_type, data)?;
            Ok(StreamEvent::BlockStop { index: stop.index })
        }
        "message_delta" => {
            let frame: MessageDeltaFrame = payload(event_type, data)?;
            Ok(StreamEvent::MessageDelta {
                stop_reason: frame.delta.stop_reason,
                usage: frame.usage.map(Usage::from),
            })
        }
        "error" => {
            let frame: ErrorFrame = payload(event_type, data)?;
            Ok(StreamEvent::Error {
                error_type: frame.error.kind,
                message: frame.error.message,
            })
        }
        other => Err(ProviderError::new(
            ProviderErrorKind::Parse,
            format!("Unknown SSE event type: {other}"),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct MessageStartFrame {
    message: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    model: String,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

impl From<WireUsage> for Usage {
    fn from(u: WireUsage) -> Self {
        Usage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            cache_read_input_tokens: u.cache_read_input_tokens,
            cache_creation_input_tokens: u.cache_creation_input_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BlockStartFrame {
    index: usize,
    content_block: BlockHeader,
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockDeltaFrame {
    index: usize,
    delta: Delta,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockStopFrame {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaFrame {
    delta: StopInfo,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct StopInfo {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorFrame {
    error: ErrorInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}
