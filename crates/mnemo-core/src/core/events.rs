//! Agent event types and the tool output envelope.
//!
//! Events feed display consumers (the CLI renderer, tests). The business
//! path never depends on them being delivered.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::providers::{ProviderErrorKind, Usage};

/// Events emitted by the agent during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    TurnStarted,

    /// Incremental thinking text.
    ReasoningDelta { text: String },

    /// Complete thinking block.
    ReasoningCompleted { text: String },

    /// Incremental assistant text.
    AssistantDelta { text: String },

    /// Complete assistant text block.
    AssistantCompleted { text: String },

    /// A tool-use block has opened; arguments are still streaming.
    ToolRequested { id: String, name: String },

    /// Raw argument fragment for a streaming tool-use block.
    ToolInputDelta { id: String, delta: String },

    /// Tool-use block closed. `input` is the parsed arguments, or the raw
    /// text as a JSON string when it did not parse.
    ToolInputCompleted {
        id: String,
        name: String,
        input: Value,
    },

    ToolStarted { id: String, name: String },

    ToolCompleted { id: String, result: ToolOutput },

    /// The working-memory document was replaced.
    ContextSynced {
        archived_count: usize,
        archive_path: String,
        new_size: usize,
    },

    /// The unsynced-call threshold was reached and a reminder was attached.
    SyncReminder { unsynced: usize },

    Error {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
    },

    /// Execution was interrupted by the user.
    Interrupted {
        #[serde(skip_serializing_if = "Option::is_none")]
        partial_content: Option<String>,
    },

    TurnCompleted { final_text: String, usage: Usage },

    /// Cumulative token usage for the current turn.
    UsageUpdate { usage: Usage },
}

/// Error categories for `AgentEvent::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    HttpStatus,
    Timeout,
    Parse,
    ApiError,
    /// The working-memory document could not be committed.
    Sync,
    /// The turn hit `agent.max_rounds`.
    MaxRoundsExceeded,
    Internal,
}

impl From<ProviderErrorKind> for ErrorKind {
    fn from(kind: ProviderErrorKind) -> Self {
        match kind {
            ProviderErrorKind::HttpStatus => ErrorKind::HttpStatus,
            ProviderErrorKind::Timeout => ErrorKind::Timeout,
            ProviderErrorKind::Parse => ErrorKind::Parse,
            ProviderErrorKind::ApiError => ErrorKind::ApiError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::HttpStatus => "http_status",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Parse => "parse",
            ErrorKind::ApiError => "api_error",
            ErrorKind::Sync => "sync",
            ErrorKind::MaxRoundsExceeded => "max_rounds_exceeded",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Failure codes carried in the tool output envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Tool arguments were not valid JSON.
    ParseError,
    /// Arguments did not match the tool schema, or a value was rejected.
    InvalidInput,
    UnknownTool,
    SandboxViolation,
    /// Filesystem failure inside the sandbox (missing file, permissions).
    IoError,
    ShellTimeout,
    InteractivePrompt,
    ShellInterrupted,
    ProcessLost,
    CommandBlocked,
    ShellUnavailable,
    SyncFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "parse_error",
            ErrorCode::InvalidInput => "invalid_input",
            ErrorCode::UnknownTool => "unknown_tool",
            ErrorCode::SandboxViolation => "sandbox_violation",
            ErrorCode::IoError => "io_error",
            ErrorCode::ShellTimeout => "shell_timeout",
            ErrorCode::InteractivePrompt => "interactive_prompt",
            ErrorCode::ShellInterrupted => "shell_interrupted",
            ErrorCode::ProcessLost => "process_lost",
            ErrorCode::CommandBlocked => "command_blocked",
            ErrorCode::ShellUnavailable => "shell_unavailable",
            ErrorCode::SyncFailed => "sync_failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const CANCELED_CODE: &str = "canceled";

/// Structured envelope for tool outputs.
///
/// - Success: `{"ok": true, "data": { ... }}`
/// - Failure: `{"ok": false, "error": {"code": "...", "message": "...", "details": "..."}}`
/// - Canceled: serialized as a failure with `code: "canceled"`, and read back
///   as `Canceled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Success { data: Value },
    Failure { error: ToolError },
    Canceled { message: String },
}

impl Serialize for ToolOutput {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("ToolOutput", 2)?;
        match self {
            ToolOutput::Success { data } => {
                state.serialize_field("ok", &true)?;
                state.serialize_field("data", data)?;
            }
            ToolOutput::Failure { error } => {
                state.serialize_field("ok", &false)?;
                state.serialize_field("error", error)?;
            }
            ToolOutput::Canceled { message } => {
                state.serialize_field("ok", &false)?;
                state.serialize_field(
                    "error",
                    &ToolError {
                        code: CANCELED_CODE.to_string(),
                        message: message.clone(),
                        details: None,
                    },
                )?;
            }
        }
        state.end()
    }
}

impl<'de> Deserialize<'de> for ToolOutput {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Envelope {
            ok: bool,
            #[serde(default)]
            data: Option<Value>,
            #[serde(default)]
            error: Option<ToolError>,
        }

        let raw = Envelope::deserialize(deserializer)?;
        Ok(match (raw.ok, raw.error) {
            (true, _) => ToolOutput::Success {
                data: raw.data.unwrap_or(Value::Null),
            },
            (false, Some(error)) if error.code == CANCELED_CODE => ToolOutput::Canceled {
                message: error.message,
            },
            (false, Some(error)) => ToolOutput::Failure { error },
            (false, None) => ToolOutput::Failure {
                error: ToolError {
                    code: "unknown".to_string(),
                    message: "Unknown error".to_string(),
                    details: None,
                },
            },
        })
    }
}

impl ToolOutput {
    pub fn success(data: Value) -> Self {
        ToolOutput::Success { data }
    }

    pub fn failure(code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        ToolOutput::Failure {
            error: ToolError {
                code: code.as_str().to_string(),
                message: message.into(),
                details,
            },
        }
    }

    /// Failure whose details carry a JSON payload (e.g. partial shell output).
    pub fn failure_with_data(code: ErrorCode, message: impl Into<String>, data: &Value) -> Self {
        Self::failure(code, message, Some(data.to_string()))
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        ToolOutput::Canceled {
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutput::Success { .. })
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            ToolOutput::Success { data } => Some(data),
            ToolOutput::Failure { .. } | ToolOutput::Canceled { .. } => None,
        }
    }

    /// Returns the failure code, `canceled` for cancellations, `None` on success.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            ToolOutput::Success { .. } => None,
            ToolOutput::Failure { error } => Some(error.code.as_str()),
            ToolOutput::Canceled { .. } => Some(CANCELED_CODE),
        }
    }

    /// Returns the error code, message and details if this is a failure.
    pub fn error_info(&self) -> Option<(&str, &str, Option<&str>)> {
        match self {
            ToolOutput::Failure { error } => Some((
                error.code.as_str(),
                error.message.as_str(),
                error.details.as_deref(),
            )),
            _ => None,
        }
    }

    /// Converts the tool output to the JSON string sent to the model.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"ok":false,"error":{"code":"serialize_error","message":"Failed to serialize tool output"}}"#.to_string()
        })
    }
}

/// Error details for failed tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn failure_envelope_shape() {
        let output = ToolOutput::failure(
            ErrorCode::SandboxViolation,
            "path escapes the sandbox",
            None,
        );
        let value: Value = serde_json::from_str(&output.to_json_string()).unwrap();
        assert_eq!(
            value,
            json!({"ok": false, "error": {"code": "sandbox_violation", "message": "path escapes the sandbox"}})
        );
    }

    #[test]
    fn canceled_reads_back_as_canceled() {
        let json_str = ToolOutput::canceled("Interrupted by user").to_json_string();
        assert!(json_str.contains(r#""code":"canceled""#));
        let parsed: ToolOutput = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, ToolOutput::canceled("Interrupted by user"));
        assert_eq!(parsed.error_code(), Some("canceled"));
    }

    #[test]
    fn failure_with_data_keeps_partial_output_as_json_text() {
        let output = ToolOutput::failure_with_data(
            ErrorCode::ShellTimeout,
            "timed out",
            &json!({"stdout": "partial"}),
        );
        let (code, _, details) = output.error_info().unwrap();
        assert_eq!(code, "shell_timeout");
        let details: Value = serde_json::from_str(details.unwrap()).unwrap();
        assert_eq!(details["stdout"], "partial");
    }

    #[test]
    fn event_tags_are_snake_case() {
        let event = AgentEvent::ContextSynced {
            archived_count: 2,
            archive_path: "storage/history/round-x.json".to_string(),
            new_size: 10,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "context_synced");
    }
}
