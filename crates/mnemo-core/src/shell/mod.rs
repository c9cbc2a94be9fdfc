//! Persistent shell session used by the `run` tool.
//!
//! State (working directory, exported variables, functions, aliases)
//! survives between commands. Each command gets stdin from `/dev/null`, a
//! timeout, and interactive-prompt detection; dangerous commands are
//! refused before they reach the shell.

mod capture;
pub mod guard;
mod prompts;
mod session;

pub use capture::{CapturedStream, truncate_at_utf8_boundary};
pub use session::{RunOutcome, RunOutput, SharedShell, ShellError, ShellSession};
