//! Tool system: the six capabilities the agent can call.
//!
//! Every tool takes JSON arguments validated against a fixed schema and
//! returns a [`ToolOutput`] envelope. Paths go through the [`Sandbox`]
//! before anything touches the filesystem or the shell.

pub mod edit;
pub mod list;
pub mod read;
pub mod run;
pub mod sync;
pub mod write;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Config;
use crate::core::events::{ErrorCode, ToolOutput};
use crate::core::memory::SharedMemory;
use crate::sandbox::Sandbox;
use crate::shell::SharedShell;

/// Tool definition for the Anthropic API.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Result of executing a tool, as sent back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolResult {
    pub fn from_output(tool_use_id: String, output: &ToolOutput) -> Self {
        Self {
            tool_use_id,
            content: output.to_json_string(),
            is_error: !output.is_ok(),
        }
    }
}

/// Limits applied inside tool handlers.
#[derive(Debug, Clone, Copy)]
pub struct ToolLimits {
    /// Largest slice a ranged `read` returns.
    pub max_read_bytes: usize,
    /// Upper bound for a per-call `timeoutSecs`.
    pub max_run_timeout: Duration,
}

impl ToolLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_read_bytes: config.agent.max_read_bytes,
            max_run_timeout: Duration::from_secs(config.shell.timeout_secs.max(1) * 20),
        }
    }
}

impl Default for ToolLimits {
    fn default() -> Self {
        Self {
            max_read_bytes: 256 * 1024,
            max_run_timeout: Duration::from_secs(600),
        }
    }
}

/// Everything a tool needs: the sandbox, the shell and the memory gate.
#[derive(Clone)]
pub struct ToolContext {
    pub sandbox: Arc<Sandbox>,
    pub shell: SharedShell,
    pub memory: SharedMemory,
    pub limits: ToolLimits,
}

impl fmt::Debug for ToolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("root", &self.sandbox.root())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Async tool handler function.
pub type ToolFuture = Pin<Box<dyn Future<Output = ToolOutput> + Send>>;
pub type ToolHandler = Arc<dyn Fn(&Value, &ToolContext) -> ToolFuture + Send + Sync>;

/// Tool registry (definitions + executors), looked up case-insensitively
/// by name or alias.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    definitions: Vec<ToolDefinition>,
    handlers: HashMap<String, ToolHandler>,
    aliases: HashMap<String, String>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("definitions", &self.definitions)
            .field("aliases", &self.aliases)
            .field("handlers_len", &self.handlers.len())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtin_tools();
        registry
    }

    pub fn register(&mut self, definition: ToolDefinition, handler: ToolHandler) {
        let name_lower = definition.name.to_ascii_lowercase();
        self.definitions
            .retain(|t| !t.name.eq_ignore_ascii_case(&definition.name));
        self.definitions.push(definition);
        self.handlers.insert(name_lower, handler);
    }

    pub fn alias(&mut self, alias: &str, target: &str) {
        self.aliases
            .insert(alias.to_ascii_lowercase(), target.to_ascii_lowercase());
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    /// Canonical (lowercase) name for `name`, following aliases.
    pub fn canonical_name(&self, name: &str) -> Option<String> {
        let lower = name.trim().to_ascii_lowercase();
        let lower = self.aliases.get(&lower).cloned().unwrap_or(lower);
        self.handlers.contains_key(&lower).then_some(lower)
    }

    /// Runs the named tool; unknown names become an `unknown_tool` failure.
    pub async fn execute(&self, name: &str, input: &Value, ctx: &ToolContext) -> ToolOutput {
        let handler = self
            .canonical_name(name)
            .and_then(|canonical| self.handlers.get(&canonical));
        match handler {
            Some(handler) => handler(input, ctx).await,
            None => self.unknown_tool_output(name),
        }
    }

    fn unknown_tool_output(&self, name: &str) -> ToolOutput {
        let mut available: Vec<_> = self.definitions.iter().map(|t| t.name.as_str()).collect();
        available.sort_unstable();
        ToolOutput::failure(
            ErrorCode::UnknownTool,
            format!("Unknown tool: {name}"),
            Some(format!("Available tools: {}", available.join(", "))),
        )
    }

    fn register_builtin_tools(&mut self) {
        self.register(
            read::definition(),
            Arc::new(|input, ctx| {
                let input = input.clone();
                let ctx = ctx.clone();
                Box::pin(async move {
                    execute_blocking(move || read::execute(&input, &ctx)).await
                })
            }),
        );

        self.register(
            write::definition(),
            Arc::new(|input, ctx| {
                let input = input.clone();
                let ctx = ctx.clone();
                Box::pin(async move {
                    execute_blocking(move || write::execute(&input, &ctx)).await
                })
            }),
        );

        self.register(
            edit::definition(),
            Arc::new(|input, ctx| {
                let input = input.clone();
                let ctx = ctx.clone();
                Box::pin(async move {
                    execute_blocking(move || edit::execute(&input, &ctx)).await
                })
            }),
        );

        self.register(
            list::definition(),
            Arc::new(|input, ctx| {
                let input = input.clone();
                let ctx = ctx.clone();
                Box::pin(async move {
                    execute_blocking(move || list::execute(&input, &ctx)).await
                })
            }),
        );

        self.register(
            run::definition(),
            Arc::new(|input, ctx| {
                let input = input.clone();
                let ctx = ctx.clone();
                Box::pin(async move { run::execute(&input, &ctx).await })
            }),
        );

        self.register(
            sync::definition(),
            Arc::new(|input, ctx| {
                let input = input.clone();
                let ctx = ctx.clone();
                Box::pin(async move { sync::execute(&input, &ctx).await })
            }),
        );

        for (alias, target) in [
            ("read_file", "read"),
            ("write_file", "write"),
            ("create_file", "write"),
            ("edit_file", "edit"),
            ("list_directory", "list"),
            ("shell", "run"),
            ("execute_command", "run"),
            ("sync_context", "sync"),
        ] {
            self.alias(alias, target);
        }
    }
}

/// Serde helpers for numbers that models sometimes send as strings
/// (`"12"` instead of `12`).
pub(crate) mod lenient {
    use serde::de::{self, Deserialize, Deserializer};
    use serde_json::Value;

    fn to_u64<E: de::Error>(value: &Value) -> Result<u64, E> {
        match value {
            Value::Number(n) => n
                .as_u64()
                .ok_or_else(|| E::custom("expected a non-negative integer")),
            Value::String(s) => s
                .trim()
                .parse::<u64>()
                .map_err(|_| E::custom(format!("invalid number string: {s}"))),
            _ => Err(E::custom("expected number or numeric string")),
        }
    }

    pub fn usize<'de, D>(deserializer: D) -> Result<usize, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let n = to_u64::<D::Error>(&value)?;
        usize::try_from(n).map_err(|_| de::Error::custom("number too large"))
    }

    pub fn optional_usize<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => {
                let n = to_u64::<D::Error>(&value)?;
                usize::try_from(n)
                    .map(Some)
                    .map_err(|_| de::Error::custom("number too large"))
            }
        }
    }

    pub fn optional_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => to_u64::<D::Error>(&value).map(Some),
        }
    }
}

/// Parses tool arguments into the tool's input struct.
///
/// # Errors
/// Returns an `invalid_input` failure naming the tool.
pub(crate) fn parse_input<T: DeserializeOwned>(tool: &str, input: &Value) -> Result<T, ToolOutput> {
    serde_json::from_value(input.clone()).map_err(|e| {
        ToolOutput::failure(
            ErrorCode::InvalidInput,
            format!("Invalid input for {tool} tool"),
            Some(format!("Parse error: {e}")),
        )
    })
}

/// Maps a filesystem error on `path` to an `io_error` failure.
pub(crate) fn io_failure(action: &str, path: &str, err: &std::io::Error) -> ToolOutput {
    ToolOutput::failure(
        ErrorCode::IoError,
        format!("Failed to {action} '{path}'"),
        Some(format!("OS error: {err}")),
    )
}

/// Runs a blocking tool function on the blocking pool.
async fn execute_blocking<F>(f: F) -> ToolOutput
where
    F: FnOnce() -> ToolOutput + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(output) => output,
        Err(err) => ToolOutput::failure(
            ErrorCode::IoError,
            "Tool execution panicked",
            Some(err.to_string()),
        ),
    }
}
