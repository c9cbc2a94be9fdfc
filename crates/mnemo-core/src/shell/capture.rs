//! Bounded capture of one output stream of the shell.
//!
//! Bytes are kept in memory until [`SPILL_AFTER`]; past that the full
//! stream goes to a file under the outputs directory and only the head
//! (what the model sees) plus a tail window (where the sentinel lands)
//! stay in memory.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const SPILL_AFTER: usize = 4 * 1024 * 1024;
const TAIL_WINDOW: usize = 64 * 1024;
/// Already-scanned bytes kept so a needle split across chunks is still seen.
const SCAN_OVERLAP: usize = 4096;
/// Extra head bytes so the cut can back off to a UTF-8 boundary.
const HEAD_SLACK: usize = 4;

/// Output of one stream after the command finished.
#[derive(Debug, Clone, Default)]
pub struct CapturedStream {
    pub text: String,
    pub truncated: bool,
    pub total_bytes: usize,
    /// Full output when `truncated` and the spill file could be written.
    pub full_output_path: Option<PathBuf>,
}

pub(crate) struct Capture {
    label: &'static str,
    head: Vec<u8>,
    /// Absolute offset of `window[0]` in the stream.
    window_start: usize,
    window: Vec<u8>,
    total: usize,
    scanned: usize,
    found: Option<usize>,
    spill: Option<(PathBuf, File)>,
    /// Set once spilling failed; the stream is not spilled again.
    spill_failed: bool,
    outputs_dir: PathBuf,
    keep: usize,
}

impl Capture {
    pub(crate) fn new(label: &'static str, outputs_dir: &Path, keep: usize) -> Self {
        Self {
            label,
            head: Vec::new(),
            window_start: 0,
            window: Vec::new(),
            total: 0,
            scanned: 0,
            found: None,
            spill: None,
            spill_failed: false,
            outputs_dir: outputs_dir.to_path_buf(),
            keep,
        }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len();
        if self.head.len() < self.keep + HEAD_SLACK {
            let room = self.keep + HEAD_SLACK - self.head.len();
            self.head.extend_from_slice(&chunk[..room.min(chunk.len())]);
        }
        self.window.extend_from_slice(chunk);

        if let Some((_, file)) = self.spill.as_mut() {
            if let Err(err) = file.write_all(chunk) {
                tracing::warn!(stream = self.label, %err, "failed to extend spill file");
                self.abandon_spill();
            }
        } else if self.total > SPILL_AFTER && !self.spill_failed {
            self.start_spill();
        }

        if self.window.len() > 2 * TAIL_WINDOW && (self.spill.is_some() || self.total > SPILL_AFTER)
        {
            let keep_from = self
                .found
                .unwrap_or(self.scanned)
                .min(self.scanned.saturating_sub(SCAN_OVERLAP));
            let drop = (self.window.len() - TAIL_WINDOW)
                .min(keep_from.saturating_sub(self.window_start));
            self.window.drain(..drop);
            self.window_start += drop;
        }
    }

    fn start_spill(&mut self) {
        let path = spill_path(&self.outputs_dir, self.label);
        let written = File::create(&path).and_then(|mut file| {
            file.write_all(&self.window)?;
            Ok(file)
        });
        match written {
            Ok(file) => self.spill = Some((path, file)),
            Err(err) => {
                tracing::warn!(stream = self.label, path = %path.display(), %err, "failed to create spill file");
                self.spill_failed = true;
                if path.exists()
                    && let Err(rm) = fs::remove_file(&path)
                {
                    tracing::warn!(stream = self.label, path = %path.display(), %rm, "failed to remove partial spill file");
                }
            }
        }
    }

    /// Drops an incomplete spill file; only the head survives from here on.
    fn abandon_spill(&mut self) {
        self.spill_failed = true;
        if let Some((path, file)) = self.spill.take() {
            drop(file);
            if let Err(err) = fs::remove_file(&path) {
                tracing::warn!(stream = self.label, path = %path.display(), %err, "failed to remove partial spill file");
            }
        }
    }

    /// Finds `needle` in bytes not yet scanned; returns its absolute offset.
    ///
    /// Scanning resumes where the previous call stopped, minus enough
    /// overlap for a needle split across chunks.
    pub(crate) fn find(&mut self, needle: &[u8]) -> Option<usize> {
        if self.found.is_some() {
            return self.found;
        }
        let from = self
            .scanned
            .saturating_sub(needle.len())
            .max(self.window_start);
        let hay = &self.window[from - self.window_start..];
        self.scanned = self.window_start + self.window.len();
        self.found = hay
            .windows(needle.len())
            .position(|w| w == needle)
            .map(|pos| from + pos);
        self.found
    }

    /// Bytes from absolute offset `at` to the end of the window.
    pub(crate) fn bytes_from(&self, at: usize) -> &[u8] {
        let start = at.saturating_sub(self.window_start).min(self.window.len());
        &self.window[start..]
    }

    /// The recent tail, for prompt detection.
    pub(crate) fn tail(&self) -> &[u8] {
        let start = self.window.len().saturating_sub(1024);
        &self.window[start..]
    }

    /// Closes the capture, cutting the stream at absolute offset `cut`.
    pub(crate) fn finish(self, cut: Option<usize>) -> CapturedStream {
        let end = cut.unwrap_or(self.total).min(self.total);

        if let Some((path, file)) = self.spill {
            if let Err(err) = file.set_len(end as u64) {
                tracing::warn!(stream = self.label, %err, "failed to trim spill file");
            }
            let (text, _, _) = truncate_at_utf8_boundary(&self.head, self.keep);
            return CapturedStream {
                text,
                truncated: true,
                total_bytes: end,
                full_output_path: Some(path),
            };
        }

        if self.window_start > 0 {
            // Spilling failed after the window was trimmed; only the head survives.
            let (text, _, _) = truncate_at_utf8_boundary(&self.head, self.keep);
            return CapturedStream {
                text,
                truncated: true,
                total_bytes: end,
                full_output_path: None,
            };
        }

        let bytes = &self.window[..end.saturating_sub(self.window_start).min(self.window.len())];
        let (text, truncated, _) = truncate_at_utf8_boundary(bytes, self.keep);
        let full_output_path = if truncated {
            let path = spill_path(&self.outputs_dir, self.label);
            match fs::write(&path, bytes) {
                Ok(()) => Some(path),
                Err(err) => {
                    tracing::warn!(stream = self.label, path = %path.display(), %err, "failed to write full output");
                    None
                }
            }
        } else {
            None
        };
        CapturedStream {
            text,
            truncated,
            total_bytes: bytes.len(),
            full_output_path,
        }
    }
}

fn spill_path(dir: &Path, label: &str) -> PathBuf {
    let id = uuid::Uuid::new_v4().simple();
    dir.join(format!("run-{id}-{label}.txt"))
}

/// Truncates to at most `max` bytes without splitting a UTF-8 sequence.
///
/// Returns the (lossy) text, whether it was cut, and the original size.
pub fn truncate_at_utf8_boundary(bytes: &[u8], max: usize) -> (String, bool, usize) {
    let total = bytes.len();
    if total <= max {
        return (String::from_utf8_lossy(bytes).into_owned(), false, total);
    }
    let mut end = max;
    while end > 0 && (bytes[end] & 0b1100_0000) == 0b1000_0000 {
        end -= 1;
    }
    (String::from_utf8_lossy(&bytes[..end]).into_owned(), true, total)
}
