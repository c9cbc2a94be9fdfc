//! One long-lived bash process shared by every `run` call.
//!
//! Commands are written to the shell's stdin followed by a sentinel line
//! carrying the exit status and working directory. Output is read from both
//! pipes until the sentinel shows up on each, the per-call timeout fires,
//! the program stops at an interactive prompt, or the user interrupts.

use std::borrow::Cow;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::{self, sleep_until};

use super::capture::{Capture, CapturedStream};
use super::{guard, prompts};
use crate::config::ShellConfig;
use crate::core::interrupt;

#[cfg(unix)]
use libc::{SIGINT, SIGKILL};
#[cfg(not(unix))]
const SIGINT: i32 = 2;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

const READ_CHUNK: usize = 16 * 1024;
const EXIT_WAIT: Duration = Duration::from_secs(1);
/// How long stderr may lag behind the stdout sentinel.
const STDERR_LAG: Duration = Duration::from_millis(500);
const SENTINEL_PREFIX: &[u8] = b"__MNEMO_";
/// `__MNEMO_` + 32 hex digits + `__`.
const SENTINEL_LEN: usize = SENTINEL_PREFIX.len() + 32 + 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    TimedOut,
    Interrupted,
    InteractivePrompt,
    ProcessLost,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::TimedOut => "timed_out",
            RunOutcome::Interrupted => "interrupted",
            RunOutcome::InteractivePrompt => "interactive_prompt",
            RunOutcome::ProcessLost => "process_lost",
        }
    }
}

#[derive(Debug)]
pub struct RunOutput {
    pub stdout: CapturedStream,
    pub stderr: CapturedStream,
    pub exit_code: Option<i32>,
    pub outcome: RunOutcome,
    /// Session working directory after the call.
    pub cwd: PathBuf,
    /// The trailing line that looked like an input prompt.
    pub prompt: Option<String>,
    /// Set when the session was restarted before this command ran.
    pub warning: Option<String>,
    pub duration: Duration,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.outcome == RunOutcome::Completed && self.exit_code == Some(0)
    }
}

#[derive(Debug)]
pub enum ShellError {
    /// Another command holds the session.
    Busy,
    /// The command matched a dangerous-command pattern.
    Blocked { reason: &'static str },
    /// The shell program could not be started.
    Spawn(io::Error),
    /// The command could not be delivered, even to a fresh session.
    Io(io::Error),
}

impl fmt::Display for ShellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShellError::Busy => write!(f, "The shell is busy running another command"),
            ShellError::Blocked { reason } => write!(f, "Command blocked: {reason}"),
            ShellError::Spawn(err) => write!(f, "Failed to start shell: {err}"),
            ShellError::Io(err) => write!(f, "Failed to send command to shell: {err}"),
        }
    }
}

impl std::error::Error for ShellError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShellError::Spawn(err) | ShellError::Io(err) => Some(err),
            ShellError::Busy | ShellError::Blocked { .. } => None,
        }
    }
}

struct BashProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    stderr: ChildStderr,
}

/// How the process looks after a command.
enum Aftermath {
    Healthy,
    Exited(Option<i32>),
    Wedged,
}

struct Collected {
    stdout: CapturedStream,
    stderr: CapturedStream,
    exit_code: Option<i32>,
    cwd: Option<PathBuf>,
    outcome: RunOutcome,
    prompt: Option<String>,
    aftermath: Aftermath,
}

pub struct ShellSession {
    config: ShellConfig,
    root: PathBuf,
    outputs_dir: PathBuf,
    process: Option<BashProcess>,
    cwd: PathBuf,
    pending_warning: Option<String>,
}

impl ShellSession {
    /// Creates a session rooted at `root`. The process starts on first use.
    pub fn new(config: ShellConfig, root: &Path, outputs_dir: &Path) -> Self {
        Self {
            config,
            root: root.to_path_buf(),
            outputs_dir: outputs_dir.to_path_buf(),
            process: None,
            cwd: root.to_path_buf(),
            pending_warning: None,
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }

    /// Process id of the shell, when one is running.
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(|process| process.child.id())
    }

    /// Runs `command` in the persistent shell.
    ///
    /// `working_dir` applies to this call only. `timeout` overrides the
    /// configured default.
    ///
    /// # Errors
    /// `Blocked` for refused commands, `Spawn` when no shell can be started,
    /// `Io` when the command cannot be delivered after one restart.
    pub async fn run(
        &mut self,
        command: &str,
        working_dir: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<RunOutput, ShellError> {
        if self.config.block_dangerous
            && let Some(reason) = guard::check(command)
        {
            tracing::warn!(target: "mnemo::ops", %command, reason, "command blocked");
            return Err(ShellError::Blocked { reason });
        }

        let started = Instant::now();
        let sentinel = format!("__MNEMO_{}__", uuid::Uuid::new_v4().simple());
        let script = command_script(command, working_dir, &sentinel);
        let mut warning = self.pending_warning.take();

        let init = init_script(&self.root);
        let mut delivered = false;
        for attempt in 1..=2 {
            let (process, fresh) = self.ensure_process(&mut warning)?;
            let payload = if fresh {
                Cow::Owned(format!("{init}{script}"))
            } else {
                Cow::Borrowed(script.as_str())
            };
            let sent = match process.stdin.write_all(payload.as_bytes()).await {
                Ok(()) => process.stdin.flush().await,
                Err(err) => Err(err),
            };
            match sent {
                Ok(()) => {
                    delivered = true;
                    break;
                }
                Err(err) if attempt == 1 => {
                    tracing::warn!(%err, "shell lost before command delivery; restarting");
                    self.discard_process().await;
                    warning = Some(format!(
                        "The shell process was lost before the command was delivered ({err}). \
                         A new session was started; working directory, variables and functions were reset."
                    ));
                }
                Err(err) => return Err(ShellError::Io(err)),
            }
        }
        if !delivered {
            return Err(ShellError::Io(io::Error::other("command not delivered")));
        }

        let limit = timeout.unwrap_or_else(|| self.config.timeout());
        let collected = {
            let Some(process) = self.process.as_mut() else {
                return Err(ShellError::Io(io::Error::other("shell process missing")));
            };
            collect(process, &self.config, &self.outputs_dir, &sentinel, limit).await
        };

        match collected.aftermath {
            Aftermath::Healthy => {}
            Aftermath::Exited(code) => {
                tracing::warn!(?code, "shell process exited during command");
                self.discard_process().await;
                self.pending_warning = Some(
                    "The previous command ended the shell process. This is a new session; \
                     working directory, variables and functions were reset."
                        .to_string(),
                );
            }
            Aftermath::Wedged => {
                tracing::warn!("shell did not recover after interrupt; killing it");
                self.discard_process().await;
                self.pending_warning = Some(
                    "The previous command did not stop after being interrupted, so the shell was \
                     restarted. Working directory, variables and functions were reset."
                        .to_string(),
                );
            }
        }
        if let Some(cwd) = collected.cwd {
            self.cwd = cwd;
        } else if self.process.is_none() {
            self.cwd = self.root.clone();
        }

        let output = RunOutput {
            stdout: collected.stdout,
            stderr: collected.stderr,
            exit_code: collected.exit_code,
            outcome: collected.outcome,
            cwd: self.cwd.clone(),
            prompt: collected.prompt,
            warning,
            duration: started.elapsed(),
        };
        tracing::info!(
            target: "mnemo::ops",
            %command,
            outcome = output.outcome.as_str(),
            exit_code = ?output.exit_code,
            elapsed_ms = output.duration.as_millis() as u64,
            "shell command finished"
        );
        Ok(output)
    }

    /// Asks the shell to exit, killing it if it does not within a second.
    pub async fn shutdown(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        let pid = process.child.id();
        if process.stdin.write_all(b"exit\n").await.is_ok() {
            drop(process.stdin);
            if let Ok(Ok(status)) = time::timeout(EXIT_WAIT, process.child.wait()).await {
                tracing::debug!(%status, "shell exited");
                return;
            }
        }
        signal_group(pid, SIGKILL);
        if let Err(err) = process.child.kill().await {
            tracing::debug!(%err, "shell already gone");
        }
    }

    /// Returns the live process, spawning one when there is none. The flag
    /// is set for a fresh process, which still needs the init script.
    fn ensure_process(
        &mut self,
        warning: &mut Option<String>,
    ) -> Result<(&mut BashProcess, bool), ShellError> {
        if let Some(process) = self.process.as_mut()
            && let Ok(Some(status)) = process.child.try_wait()
        {
            tracing::warn!(%status, "shell exited between commands; restarting");
            warning.get_or_insert_with(|| {
                format!(
                    "The previous shell process exited ({status}). A new session was started; \
                     working directory, variables and functions were reset."
                )
            });
            self.process = None;
        }

        let fresh = self.process.is_none();
        if fresh {
            let process = self.spawn().map_err(ShellError::Spawn)?;
            tracing::info!(pid = ?process.child.id(), root = %self.root.display(), "shell session started");
            self.cwd = self.root.clone();
            self.process = Some(process);
        }

        match self.process.as_mut() {
            Some(process) => Ok((process, fresh)),
            None => Err(ShellError::Io(io::Error::other("shell process missing"))),
        }
    }

    fn spawn(&self) -> io::Result<BashProcess> {
        let mut cmd = Command::new(&self.config.program);
        cmd.args(["--noprofile", "--norc"])
            .current_dir(&self.root)
            .env("TERM", "dumb")
            .env("NO_COLOR", "1")
            .env("PAGER", "cat")
            .env("GIT_PAGER", "cat")
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("MNEMO_ROOT", &self.root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        // SAFETY: the closure only calls setsid(2), which is async-signal-safe
        // and touches no state shared with the parent.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
        }

        let mut child = cmd.spawn()?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(io::Error::other("shell pipes unavailable"));
        };
        Ok(BashProcess {
            child,
            stdin,
            stdout,
            stderr,
        })
    }

    async fn discard_process(&mut self) {
        if let Some(mut process) = self.process.take() {
            signal_group(process.child.id(), SIGKILL);
            if let Err(err) = process.child.kill().await {
                tracing::debug!(%err, "shell already gone");
            }
        }
    }
}

/// A session behind an async mutex: `run` queues, `try_run` refuses.
#[derive(Clone)]
pub struct SharedShell {
    inner: Arc<Mutex<ShellSession>>,
}

impl SharedShell {
    pub fn new(session: ShellSession) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Runs a command, waiting for any command already in flight.
    ///
    /// # Errors
    /// See [`ShellSession::run`].
    pub async fn run(
        &self,
        command: &str,
        working_dir: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<RunOutput, ShellError> {
        self.inner.lock().await.run(command, working_dir, timeout).await
    }

    /// Runs a command only if the shell is idle.
    ///
    /// # Errors
    /// `Busy` when another command holds the session, plus every
    /// [`ShellSession::run`] error.
    pub async fn try_run(
        &self,
        command: &str,
        working_dir: Option<&Path>,
        timeout: Option<Duration>,
    ) -> Result<RunOutput, ShellError> {
        let Ok(mut session) = self.inner.try_lock() else {
            return Err(ShellError::Busy);
        };
        session.run(command, working_dir, timeout).await
    }

    pub async fn cwd(&self) -> PathBuf {
        self.inner.lock().await.cwd().to_path_buf()
    }

    pub async fn shutdown(&self) {
        self.inner.lock().await.shutdown().await;
    }
}

/// Reads both pipes until the command finishes or has to be stopped.
async fn collect(
    process: &mut BashProcess,
    config: &ShellConfig,
    outputs_dir: &Path,
    sentinel: &str,
    limit: Duration,
) -> Collected {
    let out_key = format!("\n{sentinel} ").into_bytes();
    let err_key = format!("\n{sentinel}\n").into_bytes();
    let pid = process.child.id();

    let mut stdout = Capture::new("stdout", outputs_dir, config.max_output_bytes);
    let mut stderr = Capture::new("stderr", outputs_dir, config.max_output_bytes);
    let mut out_stale = StaleSentinels::new(sentinel);
    let mut err_stale = StaleSentinels::new(sentinel);
    let mut out_buf = vec![0u8; READ_CHUNK];
    let mut err_buf = vec![0u8; READ_CHUNK];

    let deadline = time::Instant::now() + limit;
    let mut stopping: Option<(RunOutcome, time::Instant)> = None;
    let mut prompt: Option<(String, time::Instant)> = None;
    let mut status: Option<(usize, i32, PathBuf)> = None;
    let mut stderr_due: Option<time::Instant> = None;
    let mut err_cut: Option<usize> = None;
    let mut out_open = true;
    let mut err_open = true;

    let aftermath = loop {
        if status.is_some() && (err_cut.is_some() || !err_open) {
            break Aftermath::Healthy;
        }
        if !out_open {
            break Aftermath::Exited(None);
        }
        let grace_at = stopping.map_or(deadline, |(_, at)| at);
        let settle_at = prompt.as_ref().map_or(deadline, |(_, at)| *at);
        let lag_at = stderr_due.unwrap_or(deadline);

        tokio::select! {
            biased;
            read = process.stdout.read(&mut out_buf), if status.is_none() => match read {
                Ok(0) | Err(_) => out_open = false,
                Ok(n) => {
                    stdout.push(&out_stale.filter(&out_buf[..n]));
                    if let Some(at) = stdout.find(&out_key)
                        && let Some((code, cwd)) = parse_status(stdout.bytes_from(at + out_key.len()))
                    {
                        status = Some((at, code, cwd));
                        stderr_due = Some(time::Instant::now() + STDERR_LAG);
                    } else if stopping.is_none() {
                        refresh_prompt(&mut prompt, &stdout, &stderr, config);
                    }
                }
            },
            read = process.stderr.read(&mut err_buf), if err_open && err_cut.is_none() => match read {
                Ok(0) | Err(_) => err_open = false,
                Ok(n) => {
                    stderr.push(&err_stale.filter(&err_buf[..n]));
                    err_cut = stderr.find(&err_key);
                    if status.is_none() && stopping.is_none() {
                        refresh_prompt(&mut prompt, &stdout, &stderr, config);
                    }
                }
            },
            () = sleep_until(lag_at), if stderr_due.is_some() => {
                tracing::debug!("stderr sentinel missing; finishing without it");
                break Aftermath::Healthy;
            }
            () = interrupt::wait_for_interrupt(), if stopping.is_none() && status.is_none() => {
                signal_group(pid, SIGINT);
                stopping = Some((RunOutcome::Interrupted, time::Instant::now() + config.interrupt_grace()));
            }
            () = sleep_until(settle_at), if stopping.is_none() && status.is_none() && prompt.is_some() => {
                tracing::info!(prompt = ?prompt.as_ref().map(|(p, _)| p), "command is waiting for input; interrupting");
                signal_group(pid, SIGINT);
                stopping = Some((RunOutcome::InteractivePrompt, time::Instant::now() + config.interrupt_grace()));
            }
            () = sleep_until(deadline), if stopping.is_none() && status.is_none() => {
                signal_group(pid, SIGINT);
                stopping = Some((RunOutcome::TimedOut, time::Instant::now() + config.interrupt_grace()));
            }
            () = sleep_until(grace_at), if stopping.is_some() && status.is_none() => {
                break Aftermath::Wedged;
            }
        }
    };

    let mut outcome = stopping.map_or(RunOutcome::Completed, |(outcome, _)| outcome);
    let prompt = (outcome == RunOutcome::InteractivePrompt)
        .then(|| prompt.map(|(line, _)| line))
        .flatten();

    let (exit_code, cwd, out_cut, aftermath) = match aftermath {
        Aftermath::Exited(_) => {
            outcome = RunOutcome::ProcessLost;
            drain_stderr(&mut process.stderr, &mut stderr, &mut err_stale, &mut err_buf).await;
            let code = match time::timeout(EXIT_WAIT, process.child.wait()).await {
                Ok(Ok(status)) => exit_code_of(status),
                _ => None,
            };
            (code, None, None, Aftermath::Exited(code))
        }
        Aftermath::Wedged => (None, None, None, Aftermath::Wedged),
        Aftermath::Healthy => match status {
            Some((at, code, cwd)) => (Some(code), Some(cwd), Some(at), Aftermath::Healthy),
            None => (None, None, None, Aftermath::Wedged),
        },
    };

    stdout.push(&out_stale.flush());
    stderr.push(&err_stale.flush());

    Collected {
        stdout: stdout.finish(out_cut),
        stderr: stderr.finish(err_cut),
        exit_code,
        cwd,
        outcome,
        prompt,
        aftermath,
    }
}

/// Picks up whatever stderr still holds after the shell died.
async fn drain_stderr(
    pipe: &mut ChildStderr,
    capture: &mut Capture,
    stale: &mut StaleSentinels<'_>,
    buf: &mut [u8],
) {
    let until = time::Instant::now() + Duration::from_millis(200);
    while let Ok(Ok(n)) = time::timeout_at(until, pipe.read(buf)).await {
        if n == 0 {
            break;
        }
        capture.push(&stale.filter(&buf[..n]));
    }
}

/// Drops sentinel lines an earlier command left in a pipe.
///
/// When a call finishes without seeing its stderr sentinel (or stderr was
/// redirected into stdout), the line is still queued and would otherwise
/// open the next call's output. Such lines can only precede the first byte
/// the new command writes, so filtering stops at the first fresh byte.
struct StaleSentinels<'a> {
    current: &'a [u8],
    pending: Vec<u8>,
    done: bool,
}

enum Lead {
    Stale(usize),
    Undecided,
    Fresh,
}

impl<'a> StaleSentinels<'a> {
    fn new(current: &'a str) -> Self {
        Self {
            current: current.as_bytes(),
            pending: Vec::new(),
            done: false,
        }
    }

    /// Returns the part of `chunk` that belongs to the current command.
    fn filter<'b>(&mut self, chunk: &'b [u8]) -> Cow<'b, [u8]> {
        if self.done {
            return Cow::Borrowed(chunk);
        }
        self.pending.extend_from_slice(chunk);
        loop {
            match classify_lead(&self.pending, self.current) {
                Lead::Stale(len) => {
                    tracing::debug!("dropping sentinel left by an earlier command");
                    self.pending.drain(..len);
                }
                Lead::Undecided => return Cow::Borrowed(&[]),
                Lead::Fresh => return Cow::Owned(self.flush()),
            }
        }
    }

    /// Releases bytes held back while undecided.
    fn flush(&mut self) -> Vec<u8> {
        self.done = true;
        std::mem::take(&mut self.pending)
    }
}

fn classify_lead(buf: &[u8], current: &[u8]) -> Lead {
    let body = buf.strip_prefix(b"\n").unwrap_or(buf);
    if body.is_empty() {
        return Lead::Undecided;
    }
    let head = &body[..body.len().min(SENTINEL_LEN)];
    let shaped = head.iter().enumerate().all(|(i, &b)| match i {
        i if i < SENTINEL_PREFIX.len() => b == SENTINEL_PREFIX[i],
        i if i < SENTINEL_LEN - 2 => b.is_ascii_hexdigit(),
        _ => b == b'_',
    });
    if !shaped {
        return Lead::Fresh;
    }
    if head.len() < SENTINEL_LEN {
        return Lead::Undecided;
    }
    if head == current {
        return Lead::Fresh;
    }
    match body[SENTINEL_LEN..].iter().position(|&b| b == b'\n') {
        Some(end) => Lead::Stale(buf.len() - body.len() + SENTINEL_LEN + end + 1),
        None => Lead::Undecided,
    }
}

fn refresh_prompt(
    prompt: &mut Option<(String, time::Instant)>,
    stdout: &Capture,
    stderr: &Capture,
    config: &ShellConfig,
) {
    let candidate = prompts::detect(stdout.tail()).or_else(|| prompts::detect(stderr.tail()));
    match candidate {
        Some(line) if prompt.as_ref().is_some_and(|(prev, _)| *prev == line) => {}
        Some(line) => *prompt = Some((line, time::Instant::now() + config.prompt_settle())),
        None => *prompt = None,
    }
}

/// Parses `"<status> <cwd>\n"`; `None` until the line is complete.
fn parse_status(rest: &[u8]) -> Option<(i32, PathBuf)> {
    let end = rest.iter().position(|&b| b == b'\n')?;
    let line = String::from_utf8_lossy(&rest[..end]);
    let (code, cwd) = line.split_once(' ')?;
    Some((code.trim().parse().ok()?, PathBuf::from(cwd)))
}

fn exit_code_of(status: ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.code().or_else(|| status.signal().map(|sig| 128 + sig))
    }
    #[cfg(not(unix))]
    {
        status.code()
    }
}

fn single_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn init_script(root: &Path) -> String {
    format!(
        "trap ':' INT\nshopt -s expand_aliases\ncd -- {}\n",
        single_quote(&root.to_string_lossy())
    )
}

/// Wraps a command so it runs in the session shell with stdin detached,
/// then reports status and cwd behind the sentinel on both streams.
fn command_script(command: &str, working_dir: Option<&Path>, sentinel: &str) -> String {
    let body = format!("{{ eval {}\n}} < /dev/null", single_quote(command));
    let mut script = match working_dir {
        Some(dir) => format!(
            "__mnemo_prev=\"$PWD\"\ncd -- {} && {body}\n__mnemo_status=$?\ncd -- \"$__mnemo_prev\"\n",
            single_quote(&dir.to_string_lossy())
        ),
        None => format!("{body}\n__mnemo_status=$?\n"),
    };
    script.push_str(&format!(
        "printf '\\n%s %d %s\\n' '{sentinel}' \"$__mnemo_status\" \"$PWD\"\nprintf '\\n%s\\n' '{sentinel}' >&2\n"
    ));
    script
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: i32) {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg(2) has no memory-safety preconditions; `pid` leads the
    // session created for the shell by setsid.
    if unsafe { libc::killpg(pid, signal) } == -1 {
        tracing::debug!(pid, signal, err = %io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: i32) {}
