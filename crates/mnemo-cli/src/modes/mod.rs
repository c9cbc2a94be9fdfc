//! Runtime execution modes.
//!
//! - `exec`: single turn, streamed to stdout/stderr
//! - `chat`: line-oriented loop over stdin (see `cli::commands::chat`)

pub mod exec;

use std::path::Path;

use anyhow::{Context, Result};
use mnemo_core::config::Config;
use mnemo_core::core::agent::{Agent, AgentEventTx};
use mnemo_core::core::logging;
use mnemo_core::providers::anthropic::{AnthropicClient, AnthropicConfig};
use mnemo_core::sandbox::Sandbox;
use tracing_appender::non_blocking::WorkerGuard;

/// An agent wired to the Anthropic client, plus the log writer guard.
pub struct Runtime {
    pub agent: Agent,
    _log_guard: WorkerGuard,
}

impl Runtime {
    /// Opens (and bootstraps) the sandbox under `base`, starts logging and
    /// builds the agent. Events go to `events`.
    pub fn start(config: &Config, base: &Path, events: AgentEventTx) -> Result<Self> {
        let sandbox_root = config.sandbox_root(base);
        let sandbox = Sandbox::open(&sandbox_root, &config.sandbox)
            .with_context(|| format!("open sandbox at {}", sandbox_root.display()))?;

        let log_dir = config
            .logging
            .dir
            .clone()
            .unwrap_or_else(|| sandbox.root().join("logs"));
        let log_guard = logging::init(&config.logging, &log_dir)?;

        let client = AnthropicClient::new(AnthropicConfig::from_config(config)?)?;
        tracing::info!(
            model = client.model(),
            root = %sandbox.root().display(),
            "agent starting"
        );

        let agent = Agent::new(config, sandbox, Box::new(client), events)?;
        Ok(Self {
            agent,
            _log_guard: log_guard,
        })
    }
}
