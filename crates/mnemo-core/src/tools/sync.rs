//! Sync tool: replace the working-memory document.
//!
//! The only way the agent changes its memory. The content is a complete
//! replacement; the calls made since the previous sync are archived first.

use serde::Deserialize;
use serde_json::{Value, json};

use super::{ToolContext, ToolDefinition, parse_input};
use crate::core::events::ToolOutput;
use crate::core::memory::SyncReason;

pub const NAME: &str = "sync";

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: NAME.to_string(),
        description: "Replace your working memory (context_window.md) with newContent. \
                      This is your only memory between requests: include the current task, \
                      findings, decisions and next steps. Tool calls made since the last sync \
                      are archived and dropped from the conversation."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "newContent": {
                    "type": "string",
                    "description": "The complete new working-memory document (Markdown)"
                }
            },
            "required": ["newContent"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct SyncInput {
    #[serde(alias = "new_context_content", alias = "new_content")]
    new_content: String,
}

pub async fn execute(input: &Value, ctx: &ToolContext) -> ToolOutput {
    let input: SyncInput = match parse_input(NAME, input) {
        Ok(input) => input,
        Err(output) => return output,
    };

    let mut memory = ctx.memory.lock().await;
    match memory.sync(&input.new_content, SyncReason::Requested).await {
        Ok(report) => ToolOutput::success(json!({
            "archivedCount": report.archived_count,
            "archivePath": ctx.sandbox.display_path(&report.archive_path),
            "newSize": report.new_size,
        })),
        Err(err) => {
            tracing::warn!(%err, "sync tool failed");
            ToolOutput::from(&err)
        }
    }
}
