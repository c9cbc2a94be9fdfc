//! Scripted model client and helpers shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use futures_util::future::BoxFuture;
use futures_util::{StreamExt, stream};
use mnemo_core::config::{Config, SandboxConfig};
use mnemo_core::core::agent::{Agent, AgentEventRx};
use mnemo_core::core::memory::ArchiveRecord;
use mnemo_core::providers::{
    BlockKind, ChatMessage, ModelClient, ProviderStream, StreamEvent, Usage,
};
use mnemo_core::sandbox::Sandbox;
use mnemo_core::tools::ToolDefinition;
use tempfile::TempDir;

/// Hands out pre-built streams in order and records every request.
pub struct ScriptedClient {
    streams: Mutex<VecDeque<ProviderStream>>,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ModelClient for ScriptedClient {
    fn send_messages_stream<'a>(
        &'a self,
        messages: &'a [ChatMessage],
        _tools: &'a [ToolDefinition],
        _system: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ProviderStream>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(messages.to_vec());
            self.streams
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("script exhausted"))
        })
    }
}

pub fn replay(events: Vec<StreamEvent>) -> ProviderStream {
    Box::pin(stream::iter(events.into_iter().map(Ok)))
}

/// Plays `events`, then never yields again.
pub fn hanging(events: Vec<StreamEvent>) -> ProviderStream {
    Box::pin(stream::iter(events.into_iter().map(Ok)).chain(stream::pending()))
}

pub fn text_reply(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::MessageStart {
            model: "claude-test".to_string(),
            usage: Usage::default(),
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
            usage: None,
        },
        StreamEvent::MessageStop,
    ]
}

pub fn tool_reply(id: &str, name: &str, input: &serde_json::Value) -> Vec<StreamEvent> {
    vec![
        StreamEvent::MessageStart {
            model: "claude-test".to_string(),
            usage: Usage::default(),
        },
        StreamEvent::BlockStart {
            index: 0,
            kind: BlockKind::ToolUse,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
        },
        StreamEvent::ToolInputDelta {
            index: 0,
            partial_json: input.to_string(),
        },
        StreamEvent::BlockStop { index: 0 },
        StreamEvent::MessageDelta {
            stop_reason: Some("tool_use".to_string()),
            usage: None,
        },
        StreamEvent::MessageStop,
    ]
}

/// One assistant message carrying several tool calls, in order.
pub fn tool_calls_reply(calls: &[(&str, &str, serde_json::Value)]) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::MessageStart {
        model: "claude-test".to_string(),
        usage: Usage::default(),
    }];
    for (index, (id, name, input)) in calls.iter().enumerate() {
        events.push(StreamEvent::BlockStart {
            index,
            kind: BlockKind::ToolUse,
            id: Some((*id).to_string()),
            name: Some((*name).to_string()),
        });
        events.push(StreamEvent::ToolInputDelta {
            index,
            partial_json: input.to_string(),
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

pub struct TestAgent {
    pub temp: TempDir,
    pub agent: Agent,
    pub requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    pub events: AgentEventRx,
}

impl TestAgent {
    pub fn new(streams: Vec<ProviderStream>) -> Self {
        let temp = TempDir::new().unwrap();
        let sandbox =
            Sandbox::open(&temp.path().join("agent_root"), &SandboxConfig::default()).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let client = ScriptedClient {
            streams: Mutex::new(streams.into()),
            requests: Arc::clone(&requests),
        };
        let (tx, events) = tokio::sync::mpsc::channel(4096);
        let agent = Agent::new(&Config::default(), sandbox, Box::new(client), tx).unwrap();
        Self {
            temp,
            agent,
            requests,
            events,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.agent.context().sandbox.root().to_path_buf()
    }

    pub fn archives(&self) -> Vec<ArchiveRecord> {
        archives(&self.root())
    }
}

pub fn archives(root: &Path) -> Vec<ArchiveRecord> {
    let mut paths: Vec<_> = fs::read_dir(root.join("storage/history"))
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    paths.sort();
    paths
        .iter()
        .map(|p| serde_json::from_str(&fs::read_to_string(p).unwrap()).unwrap())
        .collect()
}
