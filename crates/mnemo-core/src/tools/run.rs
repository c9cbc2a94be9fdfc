//! Run tool: execute a command in the persistent shell.
//!
//! A completed command is a success envelope even with a non-zero exit
//! code; `success` in the data says whether it worked. Timeouts, prompts,
//! interrupts and a lost shell are failures whose details carry the
//! partial output.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::{ToolContext, ToolDefinition, lenient, parse_input};
use crate::core::events::{ErrorCode, ToolOutput};
use crate::shell::{CapturedStream, RunOutcome, RunOutput, ShellError};

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "run".to_string(),
        description: "Run a bash command in a persistent shell session rooted at the sandbox. \
                      The working directory, exported variables and functions persist between \
                      calls. Stdin is not available: commands that wait for input are \
                      interrupted, so pass non-interactive flags (-y, --no-pager). Long output \
                      is truncated and saved under storage/outputs/."
            .to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The bash command to run"
                },
                "workingDir": {
                    "type": "string",
                    "description": "Directory for this command only (relative to the sandbox root)"
                },
                "timeoutSecs": {
                    "type": "integer",
                    "description": "Timeout for this command in seconds"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct RunInput {
    command: String,
    #[serde(default, alias = "working_dir")]
    working_dir: Option<String>,
    #[serde(default, alias = "timeout_secs", deserialize_with = "lenient::optional_u64")]
    timeout_secs: Option<u64>,
}

pub async fn execute(input: &Value, ctx: &ToolContext) -> ToolOutput {
    let input: RunInput = match parse_input("run", input) {
        Ok(input) => input,
        Err(output) => return output,
    };
    if input.command.trim().is_empty() {
        return ToolOutput::failure(ErrorCode::InvalidInput, "command is empty", None);
    }

    let working_dir = match input.working_dir.as_deref().filter(|d| !d.trim().is_empty()) {
        None => None,
        Some(dir) => match ctx.sandbox.resolve(dir) {
            Ok(path) if path.is_dir() => Some(path),
            Ok(_) => {
                return ToolOutput::failure(
                    ErrorCode::IoError,
                    format!("workingDir '{dir}' is not an existing directory"),
                    None,
                );
            }
            Err(err) => return err.into(),
        },
    };
    let timeout = input
        .timeout_secs
        .map(|secs| Duration::from_secs(secs.max(1)).min(ctx.limits.max_run_timeout));

    let output = match ctx
        .shell
        .run(&input.command, working_dir.as_deref(), timeout)
        .await
    {
        Ok(output) => output,
        Err(err) => return shell_error_output(&err),
    };

    let data = run_data(&output, ctx);
    let timeout_secs = timeout.map_or(0, |t| t.as_secs());
    match output.outcome {
        RunOutcome::Completed => ToolOutput::success(data),
        RunOutcome::TimedOut => ToolOutput::failure_with_data(
            ErrorCode::ShellTimeout,
            if timeout_secs > 0 {
                format!("Command timed out after {timeout_secs}s and was interrupted")
            } else {
                "Command timed out and was interrupted".to_string()
            },
            &data,
        ),
        RunOutcome::InteractivePrompt => ToolOutput::failure_with_data(
            ErrorCode::InteractivePrompt,
            "Command stopped at an interactive prompt and was interrupted; rerun it \
             non-interactively (e.g. with -y or by piping the answer)",
            &data,
        ),
        RunOutcome::Interrupted => ToolOutput::failure_with_data(
            ErrorCode::ShellInterrupted,
            "Command interrupted by the user",
            &data,
        ),
        RunOutcome::ProcessLost => ToolOutput::failure_with_data(
            ErrorCode::ProcessLost,
            "The shell process exited during the command; the next command starts a new session",
            &data,
        ),
    }
}

fn shell_error_output(err: &ShellError) -> ToolOutput {
    match err {
        ShellError::Blocked { reason } => ToolOutput::failure(
            ErrorCode::CommandBlocked,
            format!("Command refused: {reason}"),
            Some("This command could damage the host and is not allowed".to_string()),
        ),
        ShellError::Busy | ShellError::Spawn(_) | ShellError::Io(_) => {
            ToolOutput::failure(ErrorCode::ShellUnavailable, err.to_string(), None)
        }
    }
}

fn run_data(output: &RunOutput, ctx: &ToolContext) -> Value {
    let mut data = Map::new();
    data.insert("stdout".into(), json!(output.stdout.text));
    data.insert("stderr".into(), json!(output.stderr.text));
    data.insert("exitCode".into(), json!(output.exit_code));
    data.insert("success".into(), json!(output.success()));
    data.insert("cwd".into(), json!(ctx.sandbox.display_path(&output.cwd)));
    if output.outcome != RunOutcome::Completed {
        data.insert("outcome".into(), json!(output.outcome.as_str()));
    }
    if let Some(prompt) = &output.prompt {
        data.insert("prompt".into(), json!(prompt));
    }
    if let Some(warning) = &output.warning {
        data.insert("warning".into(), json!(warning));
    }
    insert_truncation(&mut data, "stdout", &output.stdout, ctx);
    insert_truncation(&mut data, "stderr", &output.stderr, ctx);
    Value::Object(data)
}

fn insert_truncation(data: &mut Map<String, Value>, label: &str, stream: &CapturedStream, ctx: &ToolContext) {
    if !stream.truncated {
        return;
    }
    data.insert(format!("{label}Truncated"), json!(true));
    data.insert(format!("{label}TotalBytes"), json!(stream.total_bytes));
    if let Some(path) = &stream.full_output_path {
        data.insert(format!("{label}File"), json!(ctx.sandbox.display_path(path)));
    }
}
