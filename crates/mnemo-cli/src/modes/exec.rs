//! Streamed stdout/stderr rendering and exec wrapper.
//!
//! This module provides:
//! - `ExecRenderer` + `spawn_exec_renderer_task` for agent events
//! - `run_exec` for single-shot exec mode

use std::collections::HashMap;
use std::io::{Stderr, Stdout, Write, stderr, stdout};
use std::path::Path;
use std::time::Instant;

use anyhow::Result;
use mnemo_core::config::Config;
use mnemo_core::core::agent::{AgentEventRx, create_event_channel, spawn_broadcaster};
use mnemo_core::core::events::{AgentEvent, ToolOutput};
use tokio::task::JoinHandle;

use super::Runtime;

const RUN_TOOL: &str = "run";

/// Runs one turn for `prompt`, streaming the answer to stdout.
///
/// The sandbox is force-synced and the shell stopped before returning,
/// whether or not the turn succeeded. Returns the final assistant text.
pub async fn run_exec(prompt: &str, config: &Config, root: &Path) -> Result<String> {
    let (agent_tx, agent_rx) = create_event_channel();
    let (render_tx, render_rx) = create_event_channel();

    let renderer_handle = spawn_exec_renderer_task(render_rx);
    let broadcaster = spawn_broadcaster(agent_rx, vec![render_tx]);

    let mut runtime = match Runtime::start(config, root, agent_tx) {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = broadcaster.await;
            let _ = renderer_handle.await;
            return Err(err);
        }
    };

    let result = runtime.agent.run_turn(prompt).await;
    let shutdown = runtime.agent.shutdown().await;

    // Dropping the agent closes the channel so both tasks drain and exit.
    drop(runtime);
    let _ = broadcaster.await;
    let _ = renderer_handle.await;

    let outcome = result?;
    shutdown?;
    Ok(outcome.final_text)
}

/// CLI renderer that writes agent events to stdout/stderr.
///
/// # Output contract
/// - `AssistantDelta` → stdout
/// - tool trace, sync notices, errors → stderr
pub struct ExecRenderer {
    stdout: Stdout,
    stderr: Stderr,
    /// Whether the final newline has been printed after assistant output.
    needs_final_newline: bool,
    /// Tracks tool_use id -> name for `ToolCompleted` rendering.
    tool_names: HashMap<String, String>,
    tool_start_times: HashMap<String, Instant>,
}

impl Default for ExecRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecRenderer {
    pub fn new() -> Self {
        Self {
            stdout: stdout(),
            stderr: stderr(),
            needs_final_newline: false,
            tool_names: HashMap::new(),
            tool_start_times: HashMap::new(),
        }
    }

    /// Handles a single agent event by writing to the appropriate stream.
    pub fn handle_event(&mut self, event: &AgentEvent) {
        match event {
            AgentEvent::AssistantDelta { text } => {
                if !text.is_empty() {
                    let _ = write!(self.stdout, "{text}");
                    let _ = self.stdout.flush();
                    self.needs_final_newline = true;
                }
            }
            AgentEvent::ToolRequested { id, name } => {
                self.end_assistant_line();
                self.tool_names.insert(id.clone(), name.clone());
            }
            AgentEvent::ToolInputCompleted { id, name, input } => {
                if name == RUN_TOOL
                    && let Some(command) = input.get("command").and_then(|v| v.as_str())
                {
                    let _ = writeln!(self.stderr, "Tool requested: run command=\"{command}\"");
                }
                self.tool_names
                    .entry(id.clone())
                    .or_insert_with(|| name.clone());
            }
            AgentEvent::ToolStarted { id, name } => {
                self.tool_start_times.insert(id.clone(), Instant::now());
                let _ = write!(self.stderr, "⚙ Running {name}...");
                let _ = self.stderr.flush();
            }
            AgentEvent::ToolCompleted { id, result } => {
                let duration = self
                    .tool_start_times
                    .remove(id)
                    .map(|start| format!(" ({:.2}s)", start.elapsed().as_secs_f64()))
                    .unwrap_or_default();
                let status = if result.is_ok() { "Done" } else { "Failed" };
                let _ = writeln!(self.stderr, " {status}.{duration}");

                if self.tool_names.get(id).is_some_and(|name| name == RUN_TOOL) {
                    self.emit_run_finish_details(result);
                }
            }
            AgentEvent::ContextSynced {
                archived_count,
                archive_path,
                new_size,
            } => {
                let _ = writeln!(
                    self.stderr,
                    "Context synced: {archived_count} call(s) archived to {archive_path}, memory now {new_size} bytes"
                );
            }
            AgentEvent::SyncReminder { unsynced } => {
                let _ = writeln!(
                    self.stderr,
                    "Reminder sent: {unsynced} tool call(s) since the last sync"
                );
            }
            AgentEvent::Error {
                kind,
                message,
                details,
            } => {
                self.end_assistant_line();
                let _ = writeln!(self.stderr, "Error [{kind}]: {message}");
                if let Some(detail_text) = details {
                    let _ = writeln!(self.stderr, "  Details: {detail_text}");
                }
            }
            AgentEvent::Interrupted { .. } => {
                let _ = writeln!(self.stderr, "\n^C Interrupted.");
            }
            AgentEvent::ReasoningDelta { text } => {
                if !text.is_empty() {
                    let _ = write!(self.stderr, "{text}");
                    let _ = self.stderr.flush();
                }
            }
            AgentEvent::ReasoningCompleted { .. } => {
                let _ = writeln!(self.stderr);
                let _ = self.stderr.flush();
            }
            AgentEvent::TurnStarted
            | AgentEvent::AssistantCompleted { .. }
            | AgentEvent::ToolInputDelta { .. }
            | AgentEvent::UsageUpdate { .. }
            | AgentEvent::TurnCompleted { .. } => {}
        }
    }

    fn emit_run_finish_details(&mut self, result: &ToolOutput) {
        match result {
            ToolOutput::Success { data } => {
                if let Some(exit_code) = data.get("exitCode").and_then(serde_json::Value::as_i64) {
                    let _ = writeln!(self.stderr, "Tool finished: run exit={exit_code}");
                }
            }
            ToolOutput::Failure { error } => {
                let _ = writeln!(
                    self.stderr,
                    "Tool finished: run {}=\"{}\"",
                    error.code, error.message
                );
            }
            ToolOutput::Canceled { message } => {
                let _ = writeln!(self.stderr, "Tool finished: run canceled ({message})");
            }
        }
    }

    fn end_assistant_line(&mut self) {
        if self.needs_final_newline {
            let _ = writeln!(self.stdout);
            let _ = self.stdout.flush();
            self.needs_final_newline = false;
        }
    }

    /// Prints a final newline to stdout if needed (after assistant output completes).
    pub fn finish(&mut self) {
        self.end_assistant_line();
    }
}

/// Spawns a renderer task that consumes events until the channel closes.
pub fn spawn_exec_renderer_task(mut rx: AgentEventRx) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut renderer = ExecRenderer::new();

        while let Some(event) = rx.recv().await {
            renderer.handle_event(&event);
        }

        renderer.finish();
    })
}
