use serde::Serialize;
use serde_json::Value;

use crate::providers::shared::{ChatContentBlock, ChatMessage, MessageContent, ReasoningBlock};
use crate::tools::ToolDefinition;

#[derive(Debug, Serialize)]
pub(crate) struct ThinkingConfig {
    #[serde(rename = "type")]
    kind: &'static str,
    budget_tokens: u32,
}

impl ThinkingConfig {
    pub(crate) fn enabled(budget_tokens: u32) -> Self {
        Self {
            kind: "enabled",
            budget_tokens,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct StreamingMessagesRequest<'a> {
    pub(crate) model: &'a str,
    pub(crate) max_tokens: u32,
    pub(crate) messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) tools: Option<Vec<ApiToolDef<'a>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) system: Option<Vec<SystemBlock>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) thinking: Option<ThinkingConfig>,
    pub(crate) stream: bool,
}

/// System prompt block. The prompt changes whenever memory is synced, so no
/// cache breakpoint is attached.
#[derive(Debug, Serialize)]
pub(crate) struct SystemBlock {
    #[serde(rename = "type")]
    kind: &'static str,
    text: String,
}

impl SystemBlock {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text",
            text: text.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiToolDef<'a> {
    pub(crate) name: &'a str,
    pub(crate) description: &'a str,
    pub(crate) input_schema: &'a Value,
}

impl<'a> From<&'a ToolDefinition> for ApiToolDef<'a> {
    fn from(def: &'a ToolDefinition) -> Self {
        Self {
            name: &def.name,
            description: &def.description,
            input_schema: &def.input_schema,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ApiMessage {
    pub(crate) role: String,
    pub(crate) content: ApiMessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum ApiMessageContent {
    Text(String),
    Blocks(Vec<ApiContentBlock>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ApiContentBlock {
    Thinking {
        thinking: String,
        signature: String,
    },
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
}

impl ApiContentBlock {
    /// Unsigned thinking (an aborted block) cannot be replayed as thinking,
    /// so it is wrapped as plain text instead.
    fn from_reasoning(block: &ReasoningBlock) -> Option<Self> {
        if block.text.is_empty() {
            return None;
        }
        if block.signature.is_empty() {
            return Some(Self::Text {
                text: format!("<thinking>\n{}\n</thinking>", block.text),
            });
        }
        Some(Self::Thinking {
            thinking: block.text.clone(),
            signature: block.signature.clone(),
        })
    }
}

impl From<&ChatMessage> for ApiMessage {
    fn from(msg: &ChatMessage) -> Self {
        let content = match &msg.content {
            MessageContent::Text(text) => ApiMessageContent::Text(text.clone()),
            MessageContent::Blocks(blocks) => ApiMessageContent::Blocks(
                blocks
                    .iter()
                    .filter_map(|block| match block {
                        ChatContentBlock::Reasoning(reasoning) => {
                            ApiContentBlock::from_reasoning(reasoning)
                        }
                        ChatContentBlock::Text(text) => {
                            Some(ApiContentBlock::Text { text: text.clone() })
                        }
                        ChatContentBlock::ToolUse { id, name, input } => {
                            Some(ApiContentBlock::ToolUse {
                                id: id.clone(),
                                name: name.clone(),
                                input: input.clone(),
                            })
                        }
                        ChatContentBlock::ToolResult(result) => Some(ApiContentBlock::ToolResult {
                            tool_use_id: result.tool_use_id.clone(),
                            content: result.content.clone(),
                            is_error: result.is_error,
                        }),
                    })
                    .collect(),
            ),
        };
        ApiMessage {
            role: msg.role.clone(),
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::ToolResult;

    #[test]
    fn tool_result_omits_is_error_when_false() {
        let msg = ChatMessage::tool_results(
            vec![ToolResult {
                tool_use_id: "toolu_1".to_string(),
                content: r#"{"ok":true,"data":{}}"#.to_string(),
                is_error: false,
            }],
            None,
        );
        let api = ApiMessage::from(&msg);
        assert_eq!(
            serde_json::to_value(&api).unwrap(),
            json!({
                "role": "user",
                "content": [{
                    "type": "tool_result",
                    "tool_use_id": "toolu_1",
                    "content": "{\"ok\":true,\"data\":{}}"
                }]
            })
        );
    }

    #[test]
    fn unsigned_thinking_is_replayed_as_text() {
        let msg = ChatMessage::assistant_blocks(vec![
            ChatContentBlock::Reasoning(ReasoningBlock {
                text: "plan".to_string(),
                signature: String::new(),
            }),
            ChatContentBlock::ToolUse {
                id: "toolu_2".to_string(),
                name: "run".to_string(),
                input: json!({"command": "ls"}),
            },
        ]);
        let value = serde_json::to_value(ApiMessage::from(&msg)).unwrap();
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][0]["text"], "<thinking>\nplan\n</thinking>");
        assert_eq!(value["content"][1]["type"], "tool_use");
        assert_eq!(value["content"][1]["input"]["command"], "ls");
    }

    #[test]
    fn signed_thinking_is_replayed_verbatim() {
        let msg = ChatMessage::assistant_blocks(vec![ChatContentBlock::Reasoning(
            ReasoningBlock {
                text: "plan".to_string(),
                signature: "sig".to_string(),
            },
        )]);
        let value = serde_json::to_value(ApiMessage::from(&msg)).unwrap();
        assert_eq!(
            value["content"][0],
            json!({"type": "thinking", "thinking": "plan", "signature": "sig"})
        );
    }
}
