//! Agent module for UI-agnostic execution.
//!
//! The agent drives the model stream + tool loop for one turn and emits
//! `AgentEvent`s via async channels. No direct stdout/stderr writes occur in
//! this module. State that must outlive the turn goes through the memory
//! gate; the in-turn transcript is dropped when the turn ends.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use super::aggregator::{BlockAggregator, ContentBlock, ToolArguments, ToolUseBlock};
use super::events::{AgentEvent, ErrorCode, ErrorKind, ToolOutput};
use super::interrupt::{self, InterruptedError};
use super::memory::{ContextStore, MemoryGate, RetryPolicy, SyncReason, ToolInvocation};
use super::prompt::PromptBuilder;
use crate::config::Config;
use crate::prompts::SYNC_REMINDER_TEMPLATE;
use crate::providers::{ChatMessage, ModelClient, ProviderError, ProviderStream, Usage};
use crate::sandbox::Sandbox;
use crate::shell::{SharedShell, ShellSession};
use crate::tools::{self, ToolContext, ToolLimits, ToolRegistry, ToolResult};

/// Channel-based event sender (async, bounded).
///
/// Events are wrapped in `Arc` for cheap cloning to multiple consumers.
pub type AgentEventTx = mpsc::Sender<Arc<AgentEvent>>;

/// Channel-based event receiver (async, bounded).
pub type AgentEventRx = mpsc::Receiver<Arc<AgentEvent>>;

/// Default channel capacity for event streams.
///
/// Set higher (128) to accommodate best-effort delta sends without blocking.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 128;

/// Creates a bounded event channel with the default capacity.
pub fn create_event_channel() -> (AgentEventTx, AgentEventRx) {
    mpsc::channel(DEFAULT_EVENT_CHANNEL_CAPACITY)
}

/// Event sender wrapper that provides best-effort and reliable send modes.
///
/// Use `send_delta()` for high-volume events that can be dropped if the
/// consumer is slow. Use `send_important()` for events that must be
/// delivered (tool lifecycle, completion, errors, interrupts).
#[derive(Clone)]
pub struct EventSender {
    tx: AgentEventTx,
}

impl EventSender {
    pub fn new(tx: AgentEventTx) -> Self {
        Self { tx }
    }

    /// Best-effort send: never awaits, drops if the channel is full or closed.
    pub fn send_delta(&self, ev: AgentEvent) {
        let _ = self.tx.try_send(Arc::new(ev));
    }

    /// Reliable send: awaits delivery unless the receiver is gone.
    pub async fn send_important(&self, ev: AgentEvent) {
        let _ = self.tx.send(Arc::new(ev)).await;
    }
}

/// Spawns a task that fans one event channel out to several subscribers.
///
/// Subscribers that fall behind miss events; closed subscribers are removed.
///
/// ```ignore
/// let (agent_tx, agent_rx) = create_event_channel();
/// let (render_tx, render_rx) = create_event_channel();
/// let broadcaster = spawn_broadcaster(agent_rx, vec![render_tx]);
/// ```
pub fn spawn_broadcaster(
    mut rx: AgentEventRx,
    mut subscribers: Vec<AgentEventTx>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            subscribers.retain(|tx| match tx.try_send(Arc::clone(&event)) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Closed(_)) => false,
            });
        }
    })
}

/// Abort threshold for repeated malformed-only tool rounds.
const MAX_CONSECUTIVE_MALFORMED_ROUNDS: usize = 3;
const MALFORMED_LOOP_ABORT_MESSAGE: &str =
    "Aborting after repeated malformed tool calls with invalid JSON input";
/// Argument text kept in parse-error details and the operation log.
const ARGUMENT_PREVIEW_CHARS: usize = 200;

/// Where the turn is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    Streaming,
    Executing,
    /// A sync committed during this turn.
    Synced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    /// Text of the final, tool-free assistant message.
    pub final_text: String,
    pub rounds: usize,
    pub tool_calls: usize,
    pub synced: bool,
    pub usage: Usage,
}

#[derive(Debug, Default)]
struct RoundResults {
    results: Vec<ToolResult>,
    executed: usize,
    malformed: usize,
    synced: bool,
}

/// One agent: a model client, the tool set and the state they share.
pub struct Agent {
    client: Box<dyn ModelClient>,
    registry: ToolRegistry,
    ctx: ToolContext,
    prompt: PromptBuilder,
    sender: EventSender,
    max_rounds: usize,
    sync_reminder_threshold: usize,
    phase: TurnPhase,
}

impl Agent {
    /// Wires the shell, memory gate and tools around an opened sandbox.
    ///
    /// # Errors
    /// Returns an error if the prompt template is invalid.
    pub fn new(
        config: &Config,
        sandbox: Sandbox,
        client: Box<dyn ModelClient>,
        events: AgentEventTx,
    ) -> Result<Self> {
        let sandbox = Arc::new(sandbox);
        let shell = SharedShell::new(ShellSession::new(
            config.shell.clone(),
            sandbox.root(),
            &sandbox.outputs_dir(),
        ));
        let memory = MemoryGate::new(
            ContextStore::for_sandbox(&sandbox),
            RetryPolicy::from_config(&config.sync),
        )
        .shared();

        Ok(Self {
            client,
            registry: ToolRegistry::builtins(),
            ctx: ToolContext {
                sandbox,
                shell,
                memory,
                limits: ToolLimits::from_config(config),
            },
            prompt: PromptBuilder::from_config(config)?,
            sender: EventSender::new(events),
            max_rounds: config.agent.max_rounds.max(1),
            sync_reminder_threshold: config.agent.sync_reminder_threshold,
            phase: TurnPhase::Idle,
        })
    }

    pub fn phase(&self) -> TurnPhase {
        self.phase
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    /// Runs one turn: stream, execute tools, repeat until the model answers
    /// without tool calls.
    ///
    /// On interrupt the pending calls are archived before the
    /// `InterruptedError` is returned.
    ///
    /// # Errors
    /// Provider failures, a failed sync, `agent.max_rounds` exceeded,
    /// repeated malformed tool calls, or `InterruptedError`.
    pub async fn run_turn(&mut self, input: &str) -> Result<TurnOutcome> {
        interrupt::reset();
        self.sender.send_important(AgentEvent::TurnStarted).await;

        let result = self.drive_turn(input).await;
        self.phase = TurnPhase::Idle;

        if let Err(err) = &result
            && err.is::<InterruptedError>()
            && let Err(sync_err) = self.force_sync(SyncReason::Interrupt).await
        {
            tracing::warn!(error = %format!("{sync_err:#}"), "forced sync after interrupt failed");
        }
        result
    }

    /// Archives pending calls and stops the shell.
    ///
    /// # Errors
    /// Returns an error if the pending calls could not be archived; the
    /// shell is stopped either way.
    pub async fn shutdown(&mut self) -> Result<()> {
        let synced = self.force_sync(SyncReason::Shutdown).await;
        self.ctx.shell.shutdown().await;
        synced
    }

    /// Like [`Agent::shutdown`], for a Ctrl+C that arrived between turns:
    /// pending calls are archived as an interrupt.
    ///
    /// # Errors
    /// Returns an error if the pending calls could not be archived.
    pub async fn shutdown_interrupted(&mut self) -> Result<()> {
        let synced = self.force_sync(SyncReason::Interrupt).await;
        self.ctx.shell.shutdown().await;
        synced
    }

    async fn drive_turn(&mut self, input: &str) -> Result<TurnOutcome> {
        let mut messages = vec![ChatMessage::user(input)];
        let mut usage = Usage::default();
        let mut tool_calls = 0usize;
        let mut synced = false;
        let mut malformed_streak = 0usize;

        for round in 1..=self.max_rounds {
            ensure_not_interrupted(&self.sender, None).await?;
            self.phase = TurnPhase::Streaming;

            let system = self.render_system_prompt().await?;
            let stream = self.request_stream(&messages, &system).await?;
            let (blocks, request_usage) = self.consume_stream(stream, usage).await?;
            usage.accumulate(request_usage);

            let tool_uses: Vec<ToolUseBlock> = blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse(tool) => Some(tool.clone()),
                    _ => None,
                })
                .collect();
            let text = assistant_text(&blocks);
            if !blocks.is_empty() {
                messages.push(ChatMessage::assistant_blocks(
                    blocks.iter().map(ContentBlock::to_chat_block).collect(),
                ));
            }

            if tool_uses.is_empty() {
                self.sender
                    .send_important(AgentEvent::TurnCompleted {
                        final_text: text.clone(),
                        usage,
                    })
                    .await;
                return Ok(TurnOutcome {
                    final_text: text,
                    rounds: round,
                    tool_calls,
                    synced,
                    usage,
                });
            }

            self.phase = TurnPhase::Executing;
            let outcome = self.execute_tools(&tool_uses).await?;
            tool_calls += tool_uses.len();

            let note = self.sync_reminder().await;
            messages.push(ChatMessage::tool_results(outcome.results, note));

            if outcome.synced {
                synced = true;
                self.phase = TurnPhase::Synced;
                collapse_transcript(&mut messages);
            }

            ensure_not_interrupted(&self.sender, (!text.is_empty()).then_some(text)).await?;

            if outcome.executed == 0 && outcome.malformed > 0 {
                malformed_streak += 1;
                if malformed_streak >= MAX_CONSECUTIVE_MALFORMED_ROUNDS {
                    self.sender
                        .send_important(AgentEvent::Error {
                            kind: ErrorKind::Parse,
                            message: MALFORMED_LOOP_ABORT_MESSAGE.to_string(),
                            details: Some(
                                "The model repeatedly requested tool calls without valid arguments"
                                    .to_string(),
                            ),
                        })
                        .await;
                    return Err(anyhow!(MALFORMED_LOOP_ABORT_MESSAGE));
                }
            } else {
                malformed_streak = 0;
            }
        }

        let message = format!("Turn exceeded {} rounds", self.max_rounds);
        self.sender
            .send_important(AgentEvent::Error {
                kind: ErrorKind::MaxRoundsExceeded,
                message: message.clone(),
                details: Some("Raise agent.max_rounds or split the task".to_string()),
            })
            .await;
        Err(anyhow!(message))
    }

    async fn render_system_prompt(&self) -> Result<String> {
        let (memory, unsynced) = {
            let gate = self.ctx.memory.lock().await;
            let memory = gate.store().read().unwrap_or_else(|err| {
                tracing::warn!(%err, "working memory unreadable; rendering without it");
                String::new()
            });
            (memory, gate.unsynced())
        };
        self.prompt.render(&self.ctx.sandbox, &memory, unsynced)
    }

    async fn request_stream(&self, messages: &[ChatMessage], system: &str) -> Result<ProviderStream> {
        let stream_result = tokio::select! {
            biased;
            () = interrupt::wait_for_interrupt() => {
                self.sender.send_important(AgentEvent::Interrupted { partial_content: None }).await;
                return Err(InterruptedError.into());
            }
            result = self.client.send_messages_stream(messages, self.registry.definitions(), Some(system)) => result,
        };
        match stream_result {
            Ok(stream) => Ok(stream),
            Err(err) => Err(emit_error(err, &self.sender).await),
        }
    }

    async fn consume_stream(
        &self,
        stream: ProviderStream,
        turn_usage: Usage,
    ) -> Result<(Vec<ContentBlock>, Usage)> {
        let mut aggregator = BlockAggregator::new(stream)
            .with_events(self.sender.clone())
            .with_usage_offset(turn_usage);
        let mut blocks = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                () = interrupt::wait_for_interrupt() => {
                    let partial = assistant_text(&blocks);
                    self.sender
                        .send_important(AgentEvent::Interrupted {
                            partial_content: (!partial.is_empty()).then_some(partial),
                        })
                        .await;
                    return Err(InterruptedError.into());
                }
                item = aggregator.next() => item,
            };
            match next {
                Some(Ok(block)) => blocks.push(block),
                Some(Err(err)) => return Err(emit_error(err.into(), &self.sender).await),
                None => break,
            }
        }

        let summary = aggregator.summary();
        tracing::debug!(
            blocks = blocks.len(),
            stop_reason = ?summary.stop_reason,
            output_tokens = summary.usage.output_tokens,
            "stream finished"
        );
        Ok((blocks, summary.usage))
    }

    /// Executes the round's tool calls one at a time, in arrival order.
    ///
    /// Every call lands in the round buffer except a sync that committed.
    /// Calls left when an interrupt arrives are answered as canceled and
    /// recorded that way, so the interrupt archive lists them too.
    async fn execute_tools(&self, tool_uses: &[ToolUseBlock]) -> Result<RoundResults> {
        let mut round = RoundResults::default();

        for tool in tool_uses {
            if interrupt::is_interrupted() {
                let output = ToolOutput::canceled("Interrupted by user");
                self.ctx.memory.lock().await.record(
                    ToolInvocation {
                        id: tool.id.clone(),
                        name: tool.name.clone(),
                        arguments: tool.arguments.as_value(),
                    },
                    output.clone(),
                );
                self.sender
                    .send_important(AgentEvent::ToolCompleted {
                        id: tool.id.clone(),
                        result: output.clone(),
                    })
                    .await;
                round
                    .results
                    .push(ToolResult::from_output(tool.id.clone(), &output));
                continue;
            }

            self.sender
                .send_important(AgentEvent::ToolStarted {
                    id: tool.id.clone(),
                    name: tool.name.clone(),
                })
                .await;

            let started = Instant::now();
            let output = match &tool.arguments {
                ToolArguments::Parsed(input) => {
                    round.executed += 1;
                    self.registry.execute(&tool.name, input, &self.ctx).await
                }
                ToolArguments::Malformed { raw, error } => {
                    round.malformed += 1;
                    ToolOutput::failure(
                        ErrorCode::ParseError,
                        format!("Failed to parse tool arguments: {error}"),
                        Some(preview(raw)),
                    )
                }
            };

            tracing::info!(
                target: "mnemo::ops",
                tool = %tool.name,
                id = %tool.id,
                args = %preview(&tool.arguments.as_value().to_string()),
                outcome = output.error_code().unwrap_or("ok"),
                duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "tool call"
            );

            let is_sync =
                self.registry.canonical_name(&tool.name).as_deref() == Some(tools::sync::NAME);
            if is_sync && output.is_ok() {
                round.synced = true;
                if let Some(data) = output.data() {
                    self.sender
                        .send_important(context_synced_event(data))
                        .await;
                }
            } else {
                self.ctx.memory.lock().await.record(
                    ToolInvocation {
                        id: tool.id.clone(),
                        name: tool.name.clone(),
                        arguments: tool.arguments.as_value(),
                    },
                    output.clone(),
                );
            }

            self.sender
                .send_important(AgentEvent::ToolCompleted {
                    id: tool.id.clone(),
                    result: output.clone(),
                })
                .await;

            if is_sync && output.error_code() == Some(ErrorCode::SyncFailed.as_str()) {
                let (_, message, _) = output.error_info().unwrap_or(("", "sync failed", None));
                let message = format!("Working memory could not be saved: {message}");
                self.sender
                    .send_important(AgentEvent::Error {
                        kind: ErrorKind::Sync,
                        message: message.clone(),
                        details: None,
                    })
                    .await;
                return Err(anyhow!(message));
            }

            round
                .results
                .push(ToolResult::from_output(tool.id.clone(), &output));
        }

        Ok(round)
    }

    /// Reminder text once the unsynced-call counter reaches the threshold.
    async fn sync_reminder(&self) -> Option<String> {
        if self.sync_reminder_threshold == 0 {
            return None;
        }
        let unsynced = self.ctx.memory.lock().await.unsynced();
        if unsynced < self.sync_reminder_threshold {
            return None;
        }
        self.sender
            .send_important(AgentEvent::SyncReminder { unsynced })
            .await;
        let env = minijinja::Environment::new();
        Some(
            env.render_str(SYNC_REMINDER_TEMPLATE, minijinja::context! { unsynced })
                .unwrap_or_else(|_| {
                    format!("You have {unsynced} unsynced tool calls. Call `sync` now.")
                })
                .trim()
                .to_string(),
        )
    }

    async fn force_sync(&self, reason: SyncReason) -> Result<()> {
        let result = self.ctx.memory.lock().await.force_sync(reason).await;
        match result {
            Ok(Some(report)) => {
                tracing::info!(
                    ?reason,
                    archived = report.archived_count,
                    path = %report.archive_path.display(),
                    "pending tool calls archived"
                );
                self.sender
                    .send_important(AgentEvent::ContextSynced {
                        archived_count: report.archived_count,
                        archive_path: self.ctx.sandbox.display_path(&report.archive_path),
                        new_size: report.new_size,
                    })
                    .await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                self.sender
                    .send_important(AgentEvent::Error {
                        kind: ErrorKind::Sync,
                        message: format!("Failed to archive pending tool calls: {err}"),
                        details: None,
                    })
                    .await;
                Err(anyhow::Error::new(err).context("Forced context sync failed"))
            }
        }
    }
}

async fn ensure_not_interrupted(sender: &EventSender, partial_content: Option<String>) -> Result<()> {
    if interrupt::is_interrupted() {
        sender
            .send_important(AgentEvent::Interrupted { partial_content })
            .await;
        return Err(InterruptedError.into());
    }
    Ok(())
}

/// Sends an error event and returns the original error, keeping the full
/// chain (including `ProviderError` details) for callers.
async fn emit_error(err: anyhow::Error, sender: &EventSender) -> anyhow::Error {
    let event = if let Some(provider_err) = err.downcast_ref::<ProviderError>() {
        AgentEvent::Error {
            kind: provider_err.kind.clone().into(),
            message: provider_err.message.clone(),
            details: provider_err.details.clone(),
        }
    } else {
        AgentEvent::Error {
            kind: ErrorKind::Internal,
            message: err.to_string(),
            details: None,
        }
    };
    sender.send_important(event).await;
    err
}

fn assistant_text(blocks: &[ContentBlock]) -> String {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn context_synced_event(data: &Value) -> AgentEvent {
    AgentEvent::ContextSynced {
        archived_count: data["archivedCount"]
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or_default(),
        archive_path: data["archivePath"].as_str().unwrap_or_default().to_string(),
        new_size: data["newSize"]
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or_default(),
    }
}

/// Keeps the user input plus the latest assistant message and its results.
fn collapse_transcript(messages: &mut Vec<ChatMessage>) {
    if messages.len() <= 3 {
        return;
    }
    let tail = messages.split_off(messages.len() - 2);
    messages.truncate(1);
    messages.extend(tail);
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(ARGUMENT_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}... ({} bytes)", &text[..cut], text.len()),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::Mutex;

    use futures_util::future::BoxFuture;
    use futures_util::stream;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::config::SandboxConfig;
    use crate::core::memory::ArchiveRecord;
    use crate::providers::{
        BlockKind, ChatContentBlock, MessageContent, ProviderErrorKind, StreamEvent,
    };
    use crate::tools::ToolDefinition;

    #[derive(Debug, Clone)]
    struct Request {
        messages: Vec<ChatMessage>,
        system: String,
    }

    #[derive(Default)]
    struct ScriptedClient {
        replies: Mutex<VecDeque<Vec<StreamEvent>>>,
        requests: Arc<Mutex<Vec<Request>>>,
    }

    impl ModelClient for ScriptedClient {
        fn send_messages_stream<'a>(
            &'a self,
            messages: &'a [ChatMessage],
            _tools: &'a [ToolDefinition],
            system: Option<&'a str>,
        ) -> BoxFuture<'a, Result<ProviderStream>> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(Request {
                    messages: messages.to_vec(),
                    system: system.unwrap_or_default().to_string(),
                });
                let events = self
                    .replies
                    .lock()
                    .unwrap()
                    .pop_front()
                    .ok_or_else(|| anyhow!("script exhausted"))?;
                let stream: ProviderStream = Box::pin(stream::iter(events.into_iter().map(Ok)));
                Ok(stream)
            })
        }
    }

    fn text_reply(text: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::MessageStart {
                model: "claude-test".to_string(),
                usage: Usage {
                    input_tokens: 100,
                    ..Usage::default()
                },
            },
            StreamEvent::BlockStart {
                index: 0,
                kind: BlockKind::Text,
                id: None,
                name: None,
            },
            StreamEvent::TextDelta {
                index: 0,
                text: text.to_string(),
            },
            StreamEvent::BlockStop { index: 0 },
            StreamEvent::MessageDelta {
                stop_reason: Some("end_turn".to_string()),
                usage: Some(Usage {
                    output_tokens: 5,
                    ..Usage::default()
                }),
            },
            StreamEvent::MessageStop,
        ]
    }

    /// A reply with one tool-use block per `(id, name, raw json)`.
    fn tool_reply(calls: &[(&str, &str, &str)]) -> Vec<StreamEvent> {
        let mut events = vec![StreamEvent::MessageStart {
            model: "claude-test".to_string(),
            usage: Usage::default(),
        }];
        for (index, (id, name, raw)) in calls.iter().enumerate() {
            events.push(StreamEvent::BlockStart {
                index,
                kind: BlockKind::ToolUse,
                id: Some((*id).to_string()),
                name: Some((*name).to_string()),
            });
            events.push(StreamEvent::ToolInputDelta {
                index,
                partial_json: (*raw).to_string(),
            });
            events.push(StreamEvent::BlockStop { index });
        }
        events.push(StreamEvent::MessageDelta {
            stop_reason: Some("tool_use".to_string()),
            usage: None,
        });
        events.push(StreamEvent::MessageStop);
        events
    }

    struct Harness {
        _temp: TempDir,
        agent: Agent,
        requests: Arc<Mutex<Vec<Request>>>,
        events: AgentEventRx,
    }

    impl Harness {
        fn new(config: &Config, replies: Vec<Vec<StreamEvent>>) -> Self {
            let temp = TempDir::new().unwrap();
            let sandbox =
                Sandbox::open(&temp.path().join("agent_root"), &SandboxConfig::default()).unwrap();
            let requests = Arc::new(Mutex::new(Vec::new()));
            let client = ScriptedClient {
                replies: Mutex::new(replies.into()),
                requests: Arc::clone(&requests),
            };
            // Large enough that no test fills it.
            let (tx, events) = mpsc::channel(4096);
            let agent = Agent::new(config, sandbox, Box::new(client), tx).unwrap();
            Self {
                _temp: temp,
                agent,
                requests,
                events,
            }
        }

        fn root(&self) -> std::path::PathBuf {
            self.agent.context().sandbox.root().to_path_buf()
        }

        fn request(&self, n: usize) -> Request {
            self.requests.lock().unwrap()[n].clone()
        }

        fn drain_events(&mut self) -> Vec<AgentEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(Arc::unwrap_or_clone(event));
            }
            out
        }

        fn archives(&self) -> Vec<ArchiveRecord> {
            let mut paths: Vec<_> = fs::read_dir(self.root().join("storage/history"))
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect();
            paths.sort();
            paths
                .iter()
                .map(|p| serde_json::from_str(&fs::read_to_string(p).unwrap()).unwrap())
                .collect()
        }
    }

    fn tool_results(message: &ChatMessage) -> Vec<ToolResult> {
        let MessageContent::Blocks(blocks) = &message.content else {
            panic!("expected blocks");
        };
        blocks
            .iter()
            .filter_map(|b| match b {
                ChatContentBlock::ToolResult(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn text_only_turn_returns_final_text() {
        let mut h = Harness::new(&Config::default(), vec![text_reply("All done.")]);
        let outcome = h.agent.run_turn("hello").await.unwrap();

        assert_eq!(outcome.final_text, "All done.");
        assert_eq!(outcome.rounds, 1);
        assert_eq!(outcome.tool_calls, 0);
        assert!(!outcome.synced);
        assert_eq!(outcome.usage.input_tokens, 100);
        assert_eq!(h.agent.phase(), TurnPhase::Idle);
        assert!(h.request(0).system.contains("Working memory"));

        let events = h.drain_events();
        assert_eq!(events.first(), Some(&AgentEvent::TurnStarted));
        assert!(matches!(events.last(), Some(AgentEvent::TurnCompleted { .. })));
    }

    #[tokio::test]
    async fn tool_results_feed_the_next_request() {
        let mut h = Harness::new(
            &Config::default(),
            vec![
                tool_reply(&[(
                    "toolu_1",
                    "write",
                    r#"{"path": "workspace/notes.txt", "content": "hi\n"}"#,
                )]),
                text_reply("Wrote it."),
            ],
        );
        let outcome = h.agent.run_turn("write a note").await.unwrap();
        assert_eq!(outcome.rounds, 2);
        assert_eq!(outcome.tool_calls, 1);

        assert_eq!(
            fs::read_to_string(h.root().join("workspace/notes.txt")).unwrap(),
            "hi\n"
        );
        let second = h.request(1);
        assert_eq!(second.messages.len(), 3);
        let results = tool_results(&second.messages[2]);
        assert_eq!(results[0].tool_use_id, "toolu_1");
        assert!(!results[0].is_error);
        assert_eq!(h.agent.context().memory.lock().await.unsynced(), 1);
        assert!(second.system.contains("1 tool call(s) since the last sync"));
    }

    #[tokio::test]
    async fn sync_archives_round_and_collapses_transcript() {
        let mut h = Harness::new(
            &Config::default(),
            vec![
                tool_reply(&[(
                    "toolu_1",
                    "write",
                    r#"{"path": "workspace/a.txt", "content": "a"}"#,
                )]),
                tool_reply(&[("toolu_2", "list_directory", r#"{"path": "workspace"}"#)]),
                tool_reply(&[(
                    "toolu_3",
                    "sync",
                    r##"{"newContent": "# Current Task\nWrote a.txt"}"##,
                )]),
                text_reply("Synced."),
            ],
        );
        let outcome = h.agent.run_turn("go").await.unwrap();
        assert!(outcome.synced);

        let archives = h.archives();
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].entries.len(), 2);
        assert_eq!(archives[0].entries[1].invocation.name, "list_directory");
        assert_eq!(archives[0].reason, SyncReason::Requested);
        assert_eq!(
            fs::read_to_string(h.root().join("context_window.md")).unwrap(),
            "# Current Task\nWrote a.txt"
        );
        assert_eq!(h.agent.context().memory.lock().await.unsynced(), 0);

        let last = h.request(3);
        assert_eq!(last.messages.len(), 3);
        assert_eq!(last.messages[1].tool_use_ids(), vec!["toolu_3"]);
        assert!(last.system.contains("Wrote a.txt"));

        let events = h.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ContextSynced {
                archived_count: 2,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn failed_sync_is_recorded_and_not_fatal_for_invalid_input() {
        let mut h = Harness::new(
            &Config::default(),
            vec![
                tool_reply(&[("toolu_1", "sync", r#"{"newContent": "  "}"#)]),
                text_reply("ok"),
            ],
        );
        h.agent.run_turn("go").await.unwrap();
        let results = tool_results(&h.request(1).messages[2]);
        assert!(results[0].is_error);
        assert!(results[0].content.contains("invalid_input"));
        assert_eq!(h.agent.context().memory.lock().await.unsynced(), 1);
    }

    #[tokio::test]
    async fn sync_write_failure_aborts_turn() {
        let mut config = Config::default();
        config.sync.write_attempts = 2;
        config.sync.retry_backoff_ms = 1;
        let mut h = Harness::new(
            &config,
            vec![
                tool_reply(&[("toolu_1", "list", "{}")]),
                tool_reply(&[("toolu_2", "sync", r#"{"newContent": "new memory"}"#)]),
            ],
        );
        let memory = h.root().join("context_window.md");
        fs::remove_file(&memory).unwrap();
        fs::create_dir(&memory).unwrap();

        let err = h.agent.run_turn("go").await.unwrap_err();
        assert!(err.to_string().contains("could not be saved"), "{err:#}");
        // The list call and the failed sync are both kept.
        assert_eq!(h.agent.context().memory.lock().await.unsynced(), 2);
        assert!(h.archives().is_empty());
        assert!(h.drain_events().iter().any(|e| matches!(
            e,
            AgentEvent::Error {
                kind: ErrorKind::Sync,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn malformed_and_unknown_calls_are_reported_to_the_model() {
        let mut h = Harness::new(
            &Config::default(),
            vec![
                tool_reply(&[
                    ("toolu_1", "write", r#"{"path": "x.txt", "#),
                    ("toolu_2", "teleport", "{}"),
                    ("toolu_3", "read", r#"{"path": "../../etc/passwd"}"#),
                ]),
                text_reply("Sorry."),
            ],
        );
        h.agent.run_turn("go").await.unwrap();

        let second = h.request(1);
        let results = tool_results(&second.messages[2]);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_error));
        assert!(results[0].content.contains("parse_error"));
        assert!(results[1].content.contains("unknown_tool"));
        assert!(results[2].content.contains("sandbox_violation"));

        // The malformed call is replayed as a marker object.
        let MessageContent::Blocks(blocks) = &second.messages[1].content else {
            panic!("expected blocks");
        };
        assert!(matches!(
            &blocks[0],
            ChatContentBlock::ToolUse { input, .. } if input.get("_raw_malformed").is_some()
        ));
        assert_eq!(h.agent.context().memory.lock().await.unsynced(), 3);
    }

    #[tokio::test]
    async fn repeated_malformed_rounds_abort() {
        let malformed = || tool_reply(&[("toolu_x", "write", "{nope")]);
        let mut h = Harness::new(
            &Config::default(),
            vec![malformed(), malformed(), malformed(), text_reply("never")],
        );
        let err = h.agent.run_turn("go").await.unwrap_err();
        assert_eq!(err.to_string(), MALFORMED_LOOP_ABORT_MESSAGE);
        assert_eq!(h.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn max_rounds_ends_the_turn() {
        let mut config = Config::default();
        config.agent.max_rounds = 2;
        let list = || tool_reply(&[("toolu_l", "list", "{}")]);
        let mut h = Harness::new(&config, vec![list(), list(), text_reply("late")]);

        let err = h.agent.run_turn("go").await.unwrap_err();
        assert!(err.to_string().contains("exceeded 2 rounds"));
        assert!(h.drain_events().iter().any(|e| matches!(
            e,
            AgentEvent::Error {
                kind: ErrorKind::MaxRoundsExceeded,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn reminder_is_attached_at_threshold() {
        let mut config = Config::default();
        config.agent.sync_reminder_threshold = 2;
        let mut h = Harness::new(
            &config,
            vec![
                tool_reply(&[("toolu_1", "list", "{}"), ("toolu_2", "list", "{}")]),
                text_reply("ok"),
            ],
        );
        h.agent.run_turn("go").await.unwrap();

        let MessageContent::Blocks(blocks) = &h.request(1).messages[2].content else {
            panic!("expected blocks");
        };
        let Some(ChatContentBlock::Text(note)) = blocks.last() else {
            panic!("expected reminder text");
        };
        assert!(note.contains("2 tool calls since the last sync"), "{note}");
        assert!(h
            .drain_events()
            .contains(&AgentEvent::SyncReminder { unsynced: 2 }));
    }

    #[tokio::test]
    async fn provider_error_ends_turn_with_error_event() {
        let mut h = Harness::new(
            &Config::default(),
            vec![vec![
                StreamEvent::MessageStart {
                    model: "claude-test".to_string(),
                    usage: Usage::default(),
                },
                StreamEvent::Error {
                    error_type: "overloaded_error".to_string(),
                    message: "Overloaded".to_string(),
                },
            ]],
        );
        let err = h.agent.run_turn("go").await.unwrap_err();
        let provider = err.downcast_ref::<ProviderError>().unwrap();
        assert_eq!(provider.kind, ProviderErrorKind::ApiError);
        assert!(h.drain_events().iter().any(|e| matches!(
            e,
            AgentEvent::Error {
                kind: ErrorKind::ApiError,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn shutdown_archives_pending_calls_without_touching_memory() {
        let mut h = Harness::new(
            &Config::default(),
            vec![
                tool_reply(&[("toolu_1", "list", "{}")]),
                text_reply("ok"),
            ],
        );
        let before = fs::read_to_string(h.root().join("context_window.md")).unwrap();
        h.agent.run_turn("go").await.unwrap();
        h.agent.shutdown().await.unwrap();

        let archives = h.archives();
        assert_eq!(archives.len(), 1);
        assert_eq!(archives[0].reason, SyncReason::Shutdown);
        assert_eq!(archives[0].entries.len(), 1);
        assert_eq!(
            fs::read_to_string(h.root().join("context_window.md")).unwrap(),
            before
        );

        // Nothing pending: a second shutdown writes no archive.
        h.agent.shutdown().await.unwrap();
        assert_eq!(h.archives().len(), 1);
    }

    #[test]
    fn collapse_keeps_input_and_latest_exchange() {
        let mut messages = vec![
            ChatMessage::user("input"),
            ChatMessage::assistant_blocks(vec![]),
            ChatMessage::tool_results(vec![], None),
            ChatMessage::assistant_blocks(vec![ChatContentBlock::Text("last".into())]),
            ChatMessage::tool_results(vec![], Some("note".into())),
        ];
        collapse_transcript(&mut messages);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], ChatMessage::user("input"));
        assert_eq!(
            messages[1],
            ChatMessage::assistant_blocks(vec![ChatContentBlock::Text("last".into())])
        );
    }

    #[test]
    fn preview_cuts_on_char_boundary() {
        let text = "é".repeat(300);
        let cut = preview(&text);
        assert!(cut.starts_with(&"é".repeat(200)));
        assert!(cut.ends_with("(600 bytes)"));
        assert_eq!(preview(&json!({"a": 1}).to_string()), r#"{"a":1}"#);
    }
}
