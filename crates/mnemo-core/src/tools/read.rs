//! Read file tool.
//!
//! Returns UTF-8 text. A plain read returns the whole file exactly as
//! written; a 1-based inclusive line range is capped at
//! `agent.max_read_bytes`.

use std::fs;
use std::io;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{ToolContext, ToolDefinition, io_failure, lenient, parse_input};
use crate::core::events::{ErrorCode, ToolOutput};
use crate::shell::truncate_at_utf8_boundary;

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "read".to_string(),
        description: "Read a text file inside the sandbox. Optionally pass a 1-based inclusive \
                      line range. Ranged reads are capped in size; page through with further ranges."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the sandbox root"
                },
                "startLine": {
                    "type": "integer",
                    "description": "First line to return (1-based, default: 1)"
                },
                "endLine": {
                    "type": "integer",
                    "description": "Last line to return, inclusive (default: end of file)"
                }
            },
            "required": ["path"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ReadInput {
    #[serde(alias = "file_path")]
    path: String,
    #[serde(default, alias = "start_line", deserialize_with = "lenient::optional_usize")]
    start_line: Option<usize>,
    #[serde(default, alias = "end_line", deserialize_with = "lenient::optional_usize")]
    end_line: Option<usize>,
}

pub fn execute(input: &Value, ctx: &ToolContext) -> ToolOutput {
    let input: ReadInput = match parse_input("read", input) {
        Ok(input) => input,
        Err(output) => return output,
    };
    let path = match ctx.sandbox.resolve(&input.path) {
        Ok(path) => path,
        Err(err) => return err.into(),
    };

    if path.is_dir() {
        return ToolOutput::failure(
            ErrorCode::IoError,
            format!("'{}' is a directory", input.path),
            Some("Use the list tool to see its entries".to_string()),
        );
    }
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return ToolOutput::failure(
                ErrorCode::IoError,
                format!("File not found: '{}'", input.path),
                None,
            );
        }
        Err(err) => return io_failure("read", &input.path, &err),
    };
    let Ok(text) = String::from_utf8(bytes) else {
        return ToolOutput::failure(
            ErrorCode::IoError,
            format!("'{}' is not a UTF-8 text file", input.path),
            None,
        );
    };

    let lines: Vec<&str> = text.split_inclusive('\n').collect();
    let total_lines = lines.len();
    let start = input.start_line.unwrap_or(1);
    let end = input.end_line.unwrap_or(total_lines).min(total_lines);

    if start == 0 {
        return ToolOutput::failure(ErrorCode::InvalidInput, "startLine is 1-based", None);
    }
    if total_lines > 0 && start > total_lines {
        return ToolOutput::failure(
            ErrorCode::InvalidInput,
            format!("startLine {start} is past the end of the file ({total_lines} lines)"),
            None,
        );
    }
    if let Some(requested_end) = input.end_line
        && requested_end < start
    {
        return ToolOutput::failure(
            ErrorCode::InvalidInput,
            format!("endLine {requested_end} is before startLine {start}"),
            None,
        );
    }

    let selected: String = if total_lines == 0 {
        String::new()
    } else {
        lines[start - 1..end].concat()
    };
    let ranged = input.start_line.is_some() || input.end_line.is_some();
    let (content, truncated) = if ranged {
        let (content, truncated, _) =
            truncate_at_utf8_boundary(selected.as_bytes(), ctx.limits.max_read_bytes);
        (content, truncated)
    } else {
        (selected, false)
    };
    let end_line = if total_lines == 0 {
        0
    } else if truncated {
        start - 1 + content.matches('\n').count().max(1)
    } else {
        end
    };

    ToolOutput::success(json!({
        "path": ctx.sandbox.display_path(&path),
        "content": content,
        "totalLines": total_lines,
        "startLine": start.min(total_lines.max(1)),
        "endLine": end_line,
        "truncated": truncated,
    }))
}
