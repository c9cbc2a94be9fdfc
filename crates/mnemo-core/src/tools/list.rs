//! List directory tool.

use std::fs;
use std::io;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{ToolContext, ToolDefinition, io_failure, parse_input};
use crate::core::events::{ErrorCode, ToolOutput};

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "list".to_string(),
        description: "List a directory inside the sandbox. Entries are sorted by name; files \
                      carry their size in bytes and directories their item count."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory path relative to the sandbox root (default: \".\")"
                }
            },
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListInput {
    #[serde(default = "default_path", alias = "dir_path")]
    path: String,
}

fn default_path() -> String {
    ".".to_string()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

#[derive(Debug, Serialize)]
struct Entry {
    name: String,
    kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    items: Option<usize>,
}

pub fn execute(input: &Value, ctx: &ToolContext) -> ToolOutput {
    let input: ListInput = match parse_input("list", input) {
        Ok(input) => input,
        Err(output) => return output,
    };
    let path = match ctx.sandbox.resolve(&input.path) {
        Ok(path) => path,
        Err(err) => return err.into(),
    };

    let reader = match fs::read_dir(&path) {
        Ok(reader) => reader,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return ToolOutput::failure(
                ErrorCode::IoError,
                format!("Directory not found: '{}'", input.path),
                None,
            );
        }
        Err(_) if path.is_file() => {
            return ToolOutput::failure(
                ErrorCode::IoError,
                format!("'{}' is a file, not a directory", input.path),
                Some("Use the read tool to see its content".to_string()),
            );
        }
        Err(err) => return io_failure("list", &input.path, &err),
    };

    let mut entries: Vec<Entry> = reader
        .filter_map(Result::ok)
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.file_type() {
                Ok(kind) if kind.is_symlink() => Entry {
                    name,
                    kind: EntryKind::Symlink,
                    size: None,
                    items: None,
                },
                Ok(kind) if kind.is_dir() => Entry {
                    name,
                    kind: EntryKind::Directory,
                    size: None,
                    items: fs::read_dir(entry.path()).ok().map(Iterator::count),
                },
                Ok(kind) if kind.is_file() => Entry {
                    name,
                    kind: EntryKind::File,
                    size: entry.metadata().ok().map(|m| m.len()),
                    items: None,
                },
                _ => Entry {
                    name,
                    kind: EntryKind::Other,
                    size: None,
                    items: None,
                },
            }
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    ToolOutput::success(json!({
        "path": ctx.sandbox.display_path(&path),
        "entries": entries,
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::tools::test_support;

    #[test]
    fn lists_root_layout_sorted() {
        let (_temp, ctx) = test_support::context();
        let output = execute(&json!({}), &ctx);
        let data = output.data().unwrap();
        assert_eq!(data["path"], ".");

        let names: Vec<&str> = data["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            ["context_window.md", "guideline.md", "storage", "workspace"]
        );
    }

    #[test]
    fn reports_sizes_and_item_counts() {
        let (_temp, ctx) = test_support::context();
        let ws = ctx.sandbox.root().join("workspace");
        fs::write(ws.join("b.txt"), "hello").unwrap();
        fs::create_dir_all(ws.join("a_dir/inner")).unwrap();

        let output = execute(&json!({"dir_path": "workspace"}), &ctx);
        let entries = output.data().unwrap()["entries"].as_array().unwrap().clone();
        assert_eq!(entries[0], json!({"name": "a_dir", "kind": "directory", "items": 1}));
        assert_eq!(entries[1], json!({"name": "b.txt", "kind": "file", "size": 5}));
    }

    #[test]
    fn file_and_missing_paths_fail() {
        let (_temp, ctx) = test_support::context();
        let file = execute(&json!({"path": "guideline.md"}), &ctx);
        assert_eq!(file.error_code(), Some("io_error"));
        let missing = execute(&json!({"path": "workspace/none"}), &ctx);
        assert_eq!(missing.error_code(), Some("io_error"));
        let escape = execute(&json!({"path": "/"}), &ctx);
        assert_eq!(escape.error_code(), Some("sandbox_violation"));
    }
}
