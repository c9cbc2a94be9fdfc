//! Working memory and the context synchronization gate.
//!
//! The working-memory document replaces conversation history. Every tool
//! call lands in the [`RoundBuffer`]; a sync archives the buffer together
//! with the superseded document, then swaps in the new document atomically.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::core::events::{ErrorCode, ToolOutput};
use crate::sandbox::Sandbox;

/// A dispatched tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundEntry {
    pub invocation: ToolInvocation,
    pub result: ToolOutput,
}

/// Tool calls made since the last successful sync, in order.
#[derive(Debug, Default)]
pub struct RoundBuffer {
    entries: Vec<RoundEntry>,
}

impl RoundBuffer {
    pub fn push(&mut self, invocation: ToolInvocation, result: ToolOutput) {
        self.entries.push(RoundEntry { invocation, result });
    }

    pub fn entries(&self) -> &[RoundEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    /// The model called `sync`.
    Requested,
    Interrupt,
    Shutdown,
}

/// Write-once snapshot stored under the history directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub timestamp: String,
    pub reason: SyncReason,
    pub entries: Vec<RoundEntry>,
    pub previous_memory: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub archived_count: usize,
    pub archive_path: PathBuf,
    pub new_size: usize,
}

#[derive(Debug)]
pub enum SyncError {
    /// The replacement content was rejected before anything was written.
    InvalidInput(String),
    Io {
        stage: &'static str,
        source: io::Error,
    },
    /// Every attempt failed; carries the last failure.
    Exhausted { attempts: u32, last: Box<SyncError> },
}

impl SyncError {
    fn io(stage: &'static str) -> impl FnOnce(io::Error) -> SyncError {
        move |source| SyncError::Io { stage, source }
    }

    /// Code used when the failure is reported as a tool result.
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::InvalidInput(_) => ErrorCode::InvalidInput,
            SyncError::Io { .. } | SyncError::Exhausted { .. } => ErrorCode::SyncFailed,
        }
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::InvalidInput(message) => f.write_str(message),
            SyncError::Io { stage, source } => write!(f, "Failed to {stage}: {source}"),
            SyncError::Exhausted { attempts, last } => {
                write!(f, "Context sync failed after {attempts} attempts: {last}")
            }
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncError::Io { source, .. } => Some(source),
            SyncError::Exhausted { last, .. } => Some(last.as_ref()),
            SyncError::InvalidInput(_) => None,
        }
    }
}

impl From<&SyncError> for ToolOutput {
    fn from(err: &SyncError) -> Self {
        ToolOutput::failure(err.code(), err.to_string(), None)
    }
}

/// Retry policy for commits.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Attempt `n` waits `n * backoff` before retrying.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            attempts: config.write_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// The memory document and its archive directory.
#[derive(Debug, Clone)]
pub struct ContextStore {
    memory_path: PathBuf,
    history_dir: PathBuf,
}

impl ContextStore {
    pub fn new(memory_path: &Path, history_dir: &Path) -> Self {
        Self {
            memory_path: memory_path.to_path_buf(),
            history_dir: history_dir.to_path_buf(),
        }
    }

    pub fn for_sandbox(sandbox: &Sandbox) -> Self {
        Self::new(sandbox.memory_path(), sandbox.history_dir())
    }

    pub fn memory_path(&self) -> &Path {
        &self.memory_path
    }

    /// Current document; a missing file reads as empty.
    ///
    /// # Errors
    /// Returns any read error other than `NotFound`.
    pub fn read(&self) -> io::Result<String> {
        match fs::read_to_string(&self.memory_path) {
            Ok(content) => Ok(content),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err),
        }
    }

    /// Archives `buffer`, replaces the document with `new_content`, then
    /// clears the buffer.
    ///
    /// # Errors
    /// `InvalidInput` for blank content. `Io` when the archive or the
    /// document cannot be written; the buffer is then left untouched and a
    /// freshly written archive is removed again.
    pub fn sync(
        &self,
        new_content: &str,
        buffer: &mut RoundBuffer,
        reason: SyncReason,
    ) -> Result<SyncReport, SyncError> {
        validate(new_content)?;
        self.commit(new_content, buffer, reason)
    }

    /// [`sync`](Self::sync) retried with linear backoff.
    ///
    /// # Errors
    /// `InvalidInput` immediately; `Exhausted` once every attempt failed.
    pub async fn sync_with_retry(
        &self,
        new_content: &str,
        buffer: &mut RoundBuffer,
        reason: SyncReason,
        policy: RetryPolicy,
    ) -> Result<SyncReport, SyncError> {
        validate(new_content)?;
        self.commit_with_retry(new_content, buffer, reason, policy)
            .await
    }

    /// Archives a non-empty buffer and re-commits the current document.
    ///
    /// Returns `Ok(None)` when there is nothing to archive.
    ///
    /// # Errors
    /// `Io` when the current document cannot be read, `Exhausted` when
    /// every commit attempt failed.
    pub async fn force_sync(
        &self,
        buffer: &mut RoundBuffer,
        reason: SyncReason,
        policy: RetryPolicy,
    ) -> Result<Option<SyncReport>, SyncError> {
        if buffer.is_empty() {
            return Ok(None);
        }
        let current = self.read().map_err(SyncError::io("read working memory"))?;
        self.commit_with_retry(&current, buffer, reason, policy)
            .await
            .map(Some)
    }

    async fn commit_with_retry(
        &self,
        content: &str,
        buffer: &mut RoundBuffer,
        reason: SyncReason,
        policy: RetryPolicy,
    ) -> Result<SyncReport, SyncError> {
        let attempts = policy.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.commit(content, buffer, reason) {
                Ok(report) => return Ok(report),
                Err(err) if attempt < attempts => {
                    tracing::warn!(attempt, %err, "context sync attempt failed; retrying");
                    tokio::time::sleep(policy.backoff * attempt).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(SyncError::Exhausted {
                        attempts,
                        last: Box::new(err),
                    });
                }
            }
        }
    }

    fn commit(
        &self,
        content: &str,
        buffer: &mut RoundBuffer,
        reason: SyncReason,
    ) -> Result<SyncReport, SyncError> {
        let previous_memory = self.read().map_err(SyncError::io("read working memory"))?;
        let now = Utc::now();
        let record = ArchiveRecord {
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            reason,
            entries: buffer.entries.clone(),
            previous_memory,
        };
        let archive_path = self.write_archive(&record, now)?;

        if let Err(err) = self.write_document(content) {
            if let Err(rm) = fs::remove_file(&archive_path) {
                tracing::warn!(path = %archive_path.display(), %rm, "failed to remove orphaned archive");
            }
            return Err(err);
        }

        let report = SyncReport {
            archived_count: buffer.len(),
            archive_path,
            new_size: content.len(),
        };
        buffer.entries.clear();
        tracing::info!(
            target: "mnemo::ops",
            reason = ?reason,
            archived = report.archived_count,
            archive = %report.archive_path.display(),
            new_size = report.new_size,
            "context synced"
        );
        Ok(report)
    }

    fn write_archive(
        &self,
        record: &ArchiveRecord,
        now: DateTime<Utc>,
    ) -> Result<PathBuf, SyncError> {
        fs::create_dir_all(&self.history_dir).map_err(SyncError::io("create history directory"))?;
        let body =
            serde_json::to_vec_pretty(record).map_err(|e| SyncError::Io {
                stage: "serialize archive",
                source: io::Error::other(e),
            })?;
        let stamp = now.format("%Y%m%dT%H%M%S%.3fZ");

        loop {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            let path = self
                .history_dir
                .join(format!("round-{stamp}-{}.json", &suffix[..8]));
            let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(SyncError::io("create archive")(err)),
            };
            let written = file.write_all(&body).and_then(|()| file.sync_all());
            if let Err(err) = written {
                drop(file);
                if let Err(rm) = fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), %rm, "failed to remove partial archive");
                }
                return Err(SyncError::io("write archive")(err));
            }
            return Ok(path);
        }
    }

    fn write_document(&self, content: &str) -> Result<(), SyncError> {
        let dir = self
            .memory_path
            .parent()
            .unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir).map_err(SyncError::io("create temp document"))?;
        temp.write_all(content.as_bytes())
            .and_then(|()| temp.as_file().sync_all())
            .map_err(SyncError::io("write working memory"))?;
        temp.persist(&self.memory_path)
            .map_err(|e| SyncError::io("replace working memory")(e.error))?;
        Ok(())
    }
}

fn validate(new_content: &str) -> Result<(), SyncError> {
    if new_content.trim().is_empty() {
        return Err(SyncError::InvalidInput(
            "newContent is empty; a sync must carry the complete working memory".to_string(),
        ));
    }
    Ok(())
}

/// Store, buffer and retry policy behind one lock.
///
/// Tool dispatch and forced syncs both go through it, so a sync never
/// races a buffer append.
#[derive(Debug)]
pub struct MemoryGate {
    store: ContextStore,
    buffer: RoundBuffer,
    policy: RetryPolicy,
}

pub type SharedMemory = Arc<Mutex<MemoryGate>>;

impl MemoryGate {
    pub fn new(store: ContextStore, policy: RetryPolicy) -> Self {
        Self {
            store,
            buffer: RoundBuffer::default(),
            policy,
        }
    }

    pub fn shared(self) -> SharedMemory {
        Arc::new(Mutex::new(self))
    }

    pub fn store(&self) -> &ContextStore {
        &self.store
    }

    pub fn buffer(&self) -> &RoundBuffer {
        &self.buffer
    }

    pub fn record(&mut self, invocation: ToolInvocation, result: ToolOutput) {
        self.buffer.push(invocation, result);
    }

    /// Tool calls not yet archived.
    pub fn unsynced(&self) -> usize {
        self.buffer.len()
    }

    /// Replaces the document with `new_content`.
    ///
    /// # Errors
    /// See [`ContextStore::sync_with_retry`].
    pub async fn sync(
        &mut self,
        new_content: &str,
        reason: SyncReason,
    ) -> Result<SyncReport, SyncError> {
        self.store
            .sync_with_retry(new_content, &mut self.buffer, reason, self.policy)
            .await
    }

    /// Archives pending calls without changing the document.
    ///
    /// # Errors
    /// See [`ContextStore::force_sync`].
    pub async fn force_sync(&mut self, reason: SyncReason) -> Result<Option<SyncReport>, SyncError> {
        self.store
            .force_sync(&mut self.buffer, reason, self.policy)
            .await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn store(temp: &TempDir) -> ContextStore {
        let memory = temp.path().join("context_window.md");
        fs::write(&memory, "initial memory").unwrap();
        ContextStore::new(&memory, &temp.path().join("storage/history"))
    }

    fn entry(id: &str) -> (ToolInvocation, ToolOutput) {
        (
            ToolInvocation {
                id: id.to_string(),
                name: "run".to_string(),
                arguments: json!({"command": "ls"}),
            },
            ToolOutput::success(json!({"stdout": "a.txt\n"})),
        )
    }

    fn archives(temp: &TempDir) -> Vec<PathBuf> {
        let dir = temp.path().join("storage/history");
        let mut paths: Vec<_> = match fs::read_dir(&dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        };
        paths.sort();
        paths
    }

    #[test]
    fn sync_archives_buffer_and_replaces_document() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let mut buffer = RoundBuffer::default();
        let (inv, out) = entry("toolu_1");
        buffer.push(inv, out);

        let report = store
            .sync("# Current Task\nnew", &mut buffer, SyncReason::Requested)
            .unwrap();

        assert_eq!(report.archived_count, 1);
        assert_eq!(report.new_size, "# Current Task\nnew".len());
        assert!(buffer.is_empty());
        assert_eq!(store.read().unwrap(), "# Current Task\nnew");

        let name = report.archive_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("round-") && name.ends_with(".json"), "{name}");
        let record: ArchiveRecord =
            serde_json::from_slice(&fs::read(&report.archive_path).unwrap()).unwrap();
        assert_eq!(record.reason, SyncReason::Requested);
        assert_eq!(record.previous_memory, "initial memory");
        assert_eq!(record.entries[0].invocation.id, "toolu_1");
    }

    #[test]
    fn blank_content_is_rejected_without_side_effects() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let mut buffer = RoundBuffer::default();
        let (inv, out) = entry("toolu_1");
        buffer.push(inv, out);

        let err = store
            .sync("  \n", &mut buffer, SyncReason::Requested)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);
        assert_eq!(buffer.len(), 1);
        assert_eq!(store.read().unwrap(), "initial memory");
        assert!(archives(&temp).is_empty());
    }

    #[test]
    fn two_syncs_make_two_archives() {
        let temp = TempDir::new().unwrap();
        let store = store(&temp);
        let mut buffer = RoundBuffer::default();

        let first = store.sync("one", &mut buffer, SyncReason::Requested).unwrap();
        let second = store.sync("two", &mut buffer, SyncReason::Requested).unwrap();

        assert_ne!(first.archive_path, second.archive_path);
        assert_eq!(archives(&temp).len(), 2);
        assert_eq!(store.read().unwrap(), "two");
        let record: ArchiveRecord =
            serde_json::from_slice(&fs::read(&second.archive_path).unwrap()).unwrap();
        assert_eq!(record.previous_memory, "one");
    }

    #[test]
    fn failed_document_write_keeps_buffer_and_drops_archive() {
        let temp = TempDir::new().unwrap();
        // The temp document cannot be created in a missing directory.
        let memory = temp.path().join("missing/context_window.md");
        let store = ContextStore::new(&memory, &temp.path().join("storage/history"));
        let mut buffer = RoundBuffer::default();
        let (inv, out) = entry("toolu_1");
        buffer.push(inv, out);

        let err = store
            .sync("replacement", &mut buffer, SyncReason::Requested)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::SyncFailed);
        assert_eq!(buffer.len(), 1);
        assert!(archives(&temp).is_empty());
    }

    #[tokio::test]
    async fn retry_exhaustion_reports_attempts() {
        let temp = TempDir::new().unwrap();
        let memory = temp.path().join("missing/context_window.md");
        let store = ContextStore::new(&memory, &temp.path().join("storage/history"));
        let mut buffer = RoundBuffer::default();

        let policy = RetryPolicy {
            attempts: 2,
            backoff: Duration::from_millis(1),
        };
        let err = store
            .sync_with_retry("x", &mut buffer, SyncReason::Requested, policy)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn force_sync_keeps_document_and_archives_buffer() {
        let temp = TempDir::new().unwrap();
        let mut gate = MemoryGate::new(store(&temp), RetryPolicy::default());
        assert!(gate.force_sync(SyncReason::Interrupt).await.unwrap().is_none());

        let (inv, out) = entry("toolu_9");
        gate.record(inv, out);
        assert_eq!(gate.unsynced(), 1);

        let report = gate
            .force_sync(SyncReason::Interrupt)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.archived_count, 1);
        assert_eq!(gate.unsynced(), 0);
        assert_eq!(gate.store().read().unwrap(), "initial memory");

        let record: ArchiveRecord =
            serde_json::from_slice(&fs::read(&report.archive_path).unwrap()).unwrap();
        assert_eq!(record.reason, SyncReason::Interrupt);
    }
}
