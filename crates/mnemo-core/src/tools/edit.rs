//! Edit file tool: replace a 1-based inclusive line range.
//!
//! An empty `newContent` deletes the range. The file keeps its trailing
//! newline state, and replacement text is newline-terminated whenever more
//! lines follow it.

use std::fs;
use std::io;

use serde::Deserialize;
use serde_json::{Value, json};

use super::write::write_atomic;
use super::{ToolContext, ToolDefinition, io_failure, lenient, parse_input};
use crate::core::events::{ErrorCode, ToolOutput};

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "edit".to_string(),
        description: "Replace lines startLine..=endLine (1-based, inclusive) of an existing \
                      file with newContent. Pass an empty newContent to delete the lines. \
                      Read the file first to get current line numbers."
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
                    "description": "First line to replace (1-based)"
                },
                "endLine": {
                    "type": "integer",
                    "description": "Last line to replace (inclusive)"
                },
                "newContent": {
                    "type": "string",
                    "description": "Replacement text for the range"
                }
            },
            "required": ["path", "startLine", "endLine", "newContent"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct EditInput {
    #[serde(alias = "file_path")]
    path: String,
    #[serde(alias = "start_line", deserialize_with = "lenient::usize")]
    start_line: usize,
    #[serde(alias = "end_line", deserialize_with = "lenient::usize")]
    end_line: usize,
    #[serde(alias = "new_content")]
    new_content: String,
}

pub fn execute(input: &Value, ctx: &ToolContext) -> ToolOutput {
    let input: EditInput = match parse_input("edit", input) {
        Ok(input) => input,
        Err(output) => return output,
    };
    let path = match ctx.sandbox.resolve_writable(&input.path) {
        Ok(path) => path,
        Err(err) => return err.into(),
    };

    let original = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return ToolOutput::failure(
                ErrorCode::IoError,
                format!("File not found: '{}'", input.path),
                Some("Use the write tool to create new files".to_string()),
            );
        }
        Err(err) => return io_failure("read", &input.path, &err),
    };

    let (edited, total_lines) =
        match replace_lines(&original, input.start_line, input.end_line, &input.new_content) {
            Ok(result) => result,
            Err(message) => return ToolOutput::failure(ErrorCode::InvalidInput, message, None),
        };
    if let Err(err) = write_atomic(&path, edited.as_bytes()) {
        return io_failure("write", &input.path, &err);
    }

    ToolOutput::success(json!({
        "path": ctx.sandbox.display_path(&path),
        "linesReplaced": input.end_line - input.start_line + 1,
        "newLines": input.new_content.split_inclusive('\n').count(),
        "totalLines": total_lines,
    }))
}

/// Returns the edited text and its line count, or why the range is invalid.
fn replace_lines(
    original: &str,
    start: usize,
    end: usize,
    new_content: &str,
) -> Result<(String, usize), String> {
    let lines: Vec<&str> = original.split_inclusive('\n').collect();
    let total = lines.len();
    if total == 0 {
        return Err("File is empty; use the write tool instead".to_string());
    }
    if start == 0 || start > total {
        return Err(format!("startLine {start} is out of range (1..={total})"));
    }
    if end < start || end > total {
        return Err(format!("endLine {end} is out of range ({start}..={total})"));
    }

    let mut edited = String::with_capacity(original.len() + new_content.len());
    for line in &lines[..start - 1] {
        edited.push_str(line);
    }
    if !new_content.is_empty() {
        edited.push_str(new_content);
        let more_follow = end < total;
        if !new_content.ends_with('\n') && (more_follow || original.ends_with('\n')) {
            edited.push('\n');
        }
    }
    for line in &lines[end..] {
        edited.push_str(line);
    }

    let total_lines = edited.split_inclusive('\n').count();
    Ok((edited, total_lines))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::test_support;

    #[test]
    fn replaces_middle_range_and_adds_missing_newline() {
        let (text, total) = replace_lines("a\nb\nc\nd\n", 2, 3, "X").unwrap();
        assert_eq!(text, "a\nX\nd\n");
        assert_eq!(total, 3);
    }

    #[test]
    fn multi_line_replacement_grows_file() {
        let (text, total) = replace_lines("a\nb\nc\n", 2, 2, "b1\nb2\nb3\n").unwrap();
        assert_eq!(text, "a\nb1\nb2\nb3\nc\n");
        assert_eq!(total, 5);
    }

    #[test]
    fn empty_content_deletes_range() {
        let (text, total) = replace_lines("a\nb\nc\n", 1, 2, "").unwrap();
        assert_eq!(text, "c\n");
        assert_eq!(total, 1);
    }

    #[test]
    fn trailing_newline_state_is_kept() {
        let (text, _) = replace_lines("a\nb", 2, 2, "B").unwrap();
        assert_eq!(text, "a\nB");
        let (text, _) = replace_lines("a\nb\n", 2, 2, "B").unwrap();
        assert_eq!(text, "a\nB\n");
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(replace_lines("a\nb\n", 0, 1, "x").is_err());
        assert!(replace_lines("a\nb\n", 3, 3, "x").is_err());
        assert!(replace_lines("a\nb\n", 2, 1, "x").is_err());
        assert!(replace_lines("a\nb\n", 1, 5, "x").is_err());
        assert!(replace_lines("", 1, 1, "x").is_err());
    }

    #[test]
    fn edit_tool_reports_counts() {
        let (_temp, ctx) = test_support::context();
        let file = ctx.sandbox.root().join("workspace/main.py");
        fs::write(&file, "import os\nprint(1)\nprint(2)\n").unwrap();

        let output = execute(
            &json!({
                "file_path": "workspace/main.py",
                "start_line": 2,
                "end_line": "3",
                "new_content": "print('hi')\n"
            }),
            &ctx,
        );
        let data = output.data().unwrap();
        assert_eq!(data["linesReplaced"], 2);
        assert_eq!(data["newLines"], 1);
        assert_eq!(data["totalLines"], 2);
        assert_eq!(fs::read_to_string(file).unwrap(), "import os\nprint('hi')\n");
    }

    #[test]
    fn edit_refuses_memory_document() {
        let (_temp, ctx) = test_support::context();
        let output = execute(
            &json!({"path": "context_window.md", "startLine": 1, "endLine": 1, "newContent": "x"}),
            &ctx,
        );
        assert_eq!(output.error_code(), Some("sandbox_violation"));
    }
}
