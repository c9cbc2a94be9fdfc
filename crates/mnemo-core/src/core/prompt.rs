//! System prompt assembly.
//!
//! The prompt is rebuilt before every request so it always carries the
//! current working-memory document and sandbox tree.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::config::Config;
use crate::prompts::SYSTEM_PROMPT_TEMPLATE;
use crate::sandbox::Sandbox;
use crate::shell::truncate_at_utf8_boundary;

/// Largest slice of the memory document placed in the prompt (64KB).
pub const MAX_MEMORY_PROMPT_BYTES: usize = 64 * 1024;

/// Entries listed in the tree before the rest are summarized.
const MAX_TREE_ENTRIES: usize = 300;

const SKIPPED_DIRS: &[&str] = &[".git"];

#[derive(Debug, Serialize)]
struct PromptVars<'a> {
    guideline: &'a str,
    memory: &'a str,
    memory_file: &'a str,
    memory_truncated: bool,
    memory_limit: usize,
    root: String,
    date: String,
    tree: String,
    max_output_bytes: usize,
    unsynced: usize,
}

/// Renders the system prompt from a `MiniJinja` template.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: String,
    tree_max_depth: usize,
    max_output_bytes: usize,
}

impl PromptBuilder {
    /// Uses `system_prompt_template` when configured, the bundled template
    /// otherwise. The template is compiled once here so syntax errors show
    /// up at startup.
    ///
    /// # Errors
    /// Returns an error if the custom template cannot be read or parsed.
    pub fn from_config(config: &Config) -> Result<Self> {
        let template = config
            .custom_prompt_template()?
            .unwrap_or_else(|| SYSTEM_PROMPT_TEMPLATE.to_string());
        let builder = Self {
            template,
            tree_max_depth: config.sandbox.tree_max_depth,
            max_output_bytes: config.shell.max_output_bytes,
        };
        builder.environment()?;
        Ok(builder)
    }

    fn environment(&self) -> Result<Environment<'_>> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.add_template("system_prompt", &self.template)
            .context("Invalid system prompt template")?;
        Ok(env)
    }

    /// Renders the prompt for the next request.
    ///
    /// # Errors
    /// Returns an error if the guideline cannot be read or the template
    /// references an unknown variable.
    pub fn render(&self, sandbox: &Sandbox, memory: &str, unsynced: usize) -> Result<String> {
        let guideline = match fs::read_to_string(sandbox.guideline_path()) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("Failed to read {}", sandbox.guideline_path().display())
                });
            }
        };

        let (memory, memory_truncated, total) =
            truncate_at_utf8_boundary(memory.as_bytes(), MAX_MEMORY_PROMPT_BYTES);
        if memory_truncated {
            tracing::warn!(
                total,
                limit = MAX_MEMORY_PROMPT_BYTES,
                "working memory exceeds the prompt limit; truncated"
            );
        }

        let memory_file = sandbox
            .memory_path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();

        let vars = PromptVars {
            guideline: guideline.trim(),
            memory: memory.trim_end(),
            memory_file,
            memory_truncated,
            memory_limit: MAX_MEMORY_PROMPT_BYTES,
            root: sandbox.root().display().to_string(),
            date: Utc::now().format("%Y-%m-%d").to_string(),
            tree: directory_tree(sandbox.root(), self.tree_max_depth),
            max_output_bytes: self.max_output_bytes,
            unsynced,
        };

        let env = self.environment()?;
        let output = env
            .get_template("system_prompt")
            .and_then(|template| template.render(&vars))
            .context("Failed to render system prompt")?;
        Ok(output.replace("\r\n", "\n").trim().to_string())
    }
}

/// Indented listing of `root`, `max_depth` levels deep.
///
/// Directories end in `/`; files carry their size. `.git` is skipped.
pub fn directory_tree(root: &Path, max_depth: usize) -> String {
    let mut out = String::from(".\n");
    let mut listed = 0usize;
    let mut omitted = 0usize;
    walk(root, 1, max_depth, &mut out, &mut listed, &mut omitted);
    if omitted > 0 {
        let _ = writeln!(out, "... ({omitted} more entries)");
    }
    out.trim_end().to_string()
}

fn walk(
    dir: &Path,
    depth: usize,
    max_depth: usize,
    out: &mut String,
    listed: &mut usize,
    omitted: &mut usize,
) {
    if depth > max_depth {
        return;
    }
    let Ok(reader) = fs::read_dir(dir) else {
        return;
    };
    let mut entries: Vec<_> = reader.filter_map(Result::ok).collect();
    entries.sort_by_key(std::fs::DirEntry::file_name);

    let indent = "  ".repeat(depth);
    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        if SKIPPED_DIRS.contains(&name.as_str()) {
            continue;
        }
        if *listed >= MAX_TREE_ENTRIES {
            *omitted += 1;
            continue;
        }
        *listed += 1;

        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_dir() {
            let _ = writeln!(out, "{indent}{name}/");
            walk(&entry.path(), depth + 1, max_depth, out, listed, omitted);
        } else if file_type.is_symlink() {
            let _ = writeln!(out, "{indent}{name}@");
        } else {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let _ = writeln!(out, "{indent}{name} ({})", format_size(size));
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::SandboxConfig;

    fn sandbox(temp: &TempDir) -> Sandbox {
        Sandbox::open(&temp.path().join("agent_root"), &SandboxConfig::default()).unwrap()
    }

    #[test]
    fn renders_memory_guideline_and_tree() {
        let temp = TempDir::new().unwrap();
        let sandbox = sandbox(&temp);
        fs::write(sandbox.guideline_path(), "Be careful.").unwrap();
        fs::write(sandbox.root().join("workspace/main.py"), "print(1)\n").unwrap();

        let builder = PromptBuilder::from_config(&Config::default()).unwrap();
        let prompt = builder
            .render(&sandbox, "# Current Task\nShip it", 0)
            .unwrap();

        assert!(prompt.contains("Be careful."));
        assert!(prompt.contains("# Current Task\nShip it"));
        assert!(prompt.contains("Working memory (context_window.md)"));
        assert!(prompt.contains("main.py (9 B)"));
        assert!(!prompt.contains("since the last sync"));
    }

    #[test]
    fn mentions_unsynced_calls() {
        let temp = TempDir::new().unwrap();
        let sandbox = sandbox(&temp);
        let builder = PromptBuilder::from_config(&Config::default()).unwrap();
        let prompt = builder.render(&sandbox, "memory", 4).unwrap();
        assert!(prompt.contains("4 tool call(s) since the last sync"));
    }

    #[test]
    fn oversized_memory_is_cut_with_notice() {
        let temp = TempDir::new().unwrap();
        let sandbox = sandbox(&temp);
        let builder = PromptBuilder::from_config(&Config::default()).unwrap();
        let memory = "x".repeat(MAX_MEMORY_PROMPT_BYTES + 10);
        let prompt = builder.render(&sandbox, &memory, 0).unwrap();
        assert!(prompt.contains("was cut at 65536 bytes"));
        assert!(!prompt.contains(&memory));
    }

    #[test]
    fn tree_skips_git_and_respects_depth() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join(".git/objects")).unwrap();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::write(root.join("a/b/c/deep.txt"), "x").unwrap();
        fs::write(root.join("top.txt"), "hello").unwrap();

        let tree = directory_tree(root, 2);
        assert_eq!(tree, ".\n  a/\n    b/\n  top.txt (5 B)");
    }

    #[test]
    fn unknown_variable_in_custom_template_fails() {
        let temp = TempDir::new().unwrap();
        let sandbox = sandbox(&temp);
        let template = temp.path().join("prompt.md");
        fs::write(&template, "Memory: {{ memory }} {{ nope }}").unwrap();
        let config = Config {
            system_prompt_template: Some(template),
            ..Config::default()
        };

        let builder = PromptBuilder::from_config(&config).unwrap();
        assert!(builder.render(&sandbox, "m", 0).is_err());
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(12), "12 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.0 MB");
    }
}
