//! Write file tool.
//!
//! Creates or overwrites a file, creating parent directories as needed.
//! The file is replaced atomically.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::Deserialize;
use serde_json::{Value, json};
use tempfile::NamedTempFile;

use super::{ToolContext, ToolDefinition, io_failure, parse_input};
use crate::core::events::ToolOutput;

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "write".to_string(),
        description: "Create or overwrite a file inside the sandbox with the given content. \
                      Parent directories are created automatically. The working-memory \
                      document and storage/history/ cannot be written; use sync instead."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "File path relative to the sandbox root"
                },
                "content": {
                    "type": "string",
                    "description": "Complete file content"
                }
            },
            "required": ["path", "content"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WriteInput {
    #[serde(alias = "file_path")]
    path: String,
    content: String,
}

pub fn execute(input: &Value, ctx: &ToolContext) -> ToolOutput {
    let input: WriteInput = match parse_input("write", input) {
        Ok(input) => input,
        Err(output) => return output,
    };
    let path = match ctx.sandbox.resolve_writable(&input.path) {
        Ok(path) => path,
        Err(err) => return err.into(),
    };

    if let Some(parent) = path.parent()
        && let Err(err) = fs::create_dir_all(parent)
    {
        return io_failure("create parent directories for", &input.path, &err);
    }
    if let Err(err) = write_atomic(&path, input.content.as_bytes()) {
        return io_failure("write", &input.path, &err);
    }

    ToolOutput::success(json!({
        "path": ctx.sandbox.display_path(&path),
        "size": input.content.len(),
        "lineCount": input.content.lines().count(),
    }))
}

/// Writes through a temp file in the same directory, then renames.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
