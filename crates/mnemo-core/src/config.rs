//! Configuration management for mnemo.
//!
//! Loads configuration from `${MNEMO_HOME}/config.toml` with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default config file contents, embedded at compile time.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! Path resolution for the mnemo home directory.
    //!
    //! `MNEMO_HOME` resolution order:
    //! 1. `MNEMO_HOME` environment variable (if set)
    //! 2. `$HOME/.config/mnemo`

    use std::path::PathBuf;

    use anyhow::{Result, bail};

    /// Returns the mnemo home directory.
    ///
    /// # Errors
    /// Returns an error if neither `MNEMO_HOME` nor `HOME` is set.
    pub fn mnemo_home() -> Result<PathBuf> {
        if let Some(home) = std::env::var_os("MNEMO_HOME").filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(home));
        }
        match std::env::var_os("HOME").filter(|v| !v.is_empty()) {
            Some(home) => Ok(PathBuf::from(home).join(".config").join("mnemo")),
            None => bail!("Could not determine home directory (set MNEMO_HOME or HOME)"),
        }
    }

    /// Returns the path to the config.toml file.
    ///
    /// # Errors
    /// Returns an error if the home directory cannot be determined.
    pub fn config_path() -> Result<PathBuf> {
        Ok(mnemo_home()?.join("config.toml"))
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The Claude model to use
    pub model: String,

    /// Maximum tokens per response
    pub max_tokens: u32,

    /// Extended thinking budget in tokens (unset disables thinking)
    pub thinking_budget_tokens: Option<u32>,

    /// Optional path to a minijinja template replacing the built-in system prompt
    pub system_prompt_template: Option<PathBuf>,

    pub providers: ProvidersConfig,
    pub sandbox: SandboxConfig,
    pub shell: ShellConfig,
    pub agent: AgentConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

impl Config {
    const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
    const DEFAULT_MAX_TOKENS: u32 = 8192;

    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path()?)
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Model after env overrides: `MNEMO_MODEL`, then `ANTHROPIC_MODEL`.
    pub fn effective_model(&self) -> String {
        ["MNEMO_MODEL", "ANTHROPIC_MODEL"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
            .unwrap_or_else(|| self.model.clone())
    }

    /// Resolves the sandbox root against the directory passed as `--root`.
    pub fn sandbox_root(&self, base: &Path) -> PathBuf {
        if self.sandbox.root.is_absolute() {
            self.sandbox.root.clone()
        } else {
            base.join(&self.sandbox.root)
        }
    }

    /// Reads the custom system prompt template, if configured.
    ///
    /// # Errors
    /// Returns an error if the configured file cannot be read.
    pub fn custom_prompt_template(&self) -> Result<Option<String>> {
        let Some(path) = &self.system_prompt_template else {
            return Ok(None);
        };
        let content = fs::read_to_string(path).with_context(|| {
            format!("Failed to read system prompt template: {}", path.display())
        })?;
        Ok((!content.trim().is_empty()).then_some(content))
    }

    /// Creates a default config file at the given path.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, default_config_template())
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: Self::DEFAULT_MODEL.to_string(),
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            thinking_budget_tokens: None,
            system_prompt_template: None,
            providers: ProvidersConfig::default(),
            sandbox: SandboxConfig::default(),
            shell: ShellConfig::default(),
            agent: AgentConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub anthropic: ProviderConfig,
}

/// Provider configuration entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Optional API key (overrides `ANTHROPIC_API_KEY`).
    pub api_key: Option<String>,
    /// Optional API base URL (for proxies). `ANTHROPIC_BASE_URL` wins.
    pub base_url: Option<String>,
    /// Whole-request timeout, covering the streamed body.
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            request_timeout_secs: 600,
        }
    }
}

/// Layout of the agent's sandbox directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Sandbox root, relative to `--root` unless absolute.
    pub root: PathBuf,
    /// Working-memory document name inside the root.
    pub memory_file: String,
    /// Guideline document name inside the root.
    pub guideline_file: String,
    /// Depth of the directory tree shown in the system prompt.
    pub tree_max_depth: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("agent_root"),
            memory_file: "context_window.md".to_string(),
            guideline_file: "guideline.md".to_string(),
            tree_max_depth: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    pub program: String,
    /// Default per-command timeout.
    pub timeout_secs: u64,
    /// How long to wait for the sentinel after interrupting a command.
    pub interrupt_grace_ms: u64,
    /// How long a prompt-looking trailing line must stay unchanged.
    pub prompt_settle_ms: u64,
    /// Per-stream cap on output returned to the model.
    pub max_output_bytes: usize,
    /// Refuse commands matching the dangerous-command patterns.
    pub block_dangerous: bool,
}

impl ShellConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    pub fn prompt_settle(&self) -> Duration {
        Duration::from_millis(self.prompt_settle_ms)
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: "bash".to_string(),
            timeout_secs: 30,
            interrupt_grace_ms: 2000,
            prompt_settle_ms: 250,
            max_output_bytes: 40 * 1024,
            block_dangerous: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Stream/execute rounds allowed per turn.
    pub max_rounds: usize,
    /// Unsynced tool calls before a sync reminder is attached.
    pub sync_reminder_threshold: usize,
    /// Largest slice a ranged `read` returns.
    pub max_read_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_rounds: 25,
            sync_reminder_threshold: 5,
            max_read_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub write_attempts: u32,
    /// Backoff step; attempt `n` waits `n * retry_backoff_ms`.
    pub retry_backoff_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            write_attempts: 3,
            retry_backoff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `MNEMO_LOG`/`RUST_LOG` are unset.
    pub level: Option<String>,
    /// Log directory (defaults to `<sandbox root>/logs`).
    pub dir: Option<PathBuf>,
    /// Also log to stderr.
    pub stderr: bool,
}
