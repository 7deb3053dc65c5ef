//! NDJSON file implementation of `AuditSink`.
//!
//! One process owns one log file. On open the existing log is verified from
//! the first line and the chain resumes where it ended; a torn final line
//! left by a crash mid-append is cut off first. A log that fails
//! verification is refused rather than extended.
//!
//! Lines are buffered in memory and written whole. A write that fails
//! partway is cut back to the last complete line, and the record that
//! failed is dropped without advancing the chain.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use pitboss_contracts::{
    audit::AuditEntry,
    error::{PitbossError, PitbossResult},
};
use pitboss_core::traits::AuditSink;

use crate::{
    chain::{seal, walk, ChainBreak},
    event::ChainHead,
};

/// Buffered bytes are written once they pass this size even without fsync.
const WRITE_THRESHOLD: usize = 64 * 1024;

/// The file operations the sink needs; split out so a failing disk can be
/// stood in for.
trait LogFile: Write {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()>;
    fn sync(&mut self) -> std::io::Result<()>;
}

impl LogFile for File {
    fn truncate_to(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }
}

struct FileState<F: LogFile = File> {
    file: F,
    /// Complete lines not yet written.
    pending: Vec<u8>,
    /// Length of the file up to its last complete line.
    durable_len: u64,
    head: ChainHead,
}

impl<F: LogFile> FileState<F> {
    fn write_pending(&mut self) -> std::io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.file.write_all(&self.pending) {
            if let Err(trunc) = self.file.truncate_to(self.durable_len) {
                warn!(error = %trunc, "failed to cut a torn audit line");
            }
            return Err(e);
        }
        self.durable_len += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Buffer one sealed line, writing it out when `write_now` is set. On a
    /// failed write the line is dropped and the chain head stays put.
    fn push_line(&mut self, line: &str, head: ChainHead, write_now: bool) -> std::io::Result<()> {
        let rollback = self.pending.len();
        self.pending.extend_from_slice(line.as_bytes());
        self.pending.push(b'\n');
        if write_now || self.pending.len() >= WRITE_THRESHOLD {
            if let Err(e) = self.write_pending() {
                // Earlier buffered lines stay queued for the next write.
                self.pending.truncate(rollback);
                return Err(e);
            }
        }
        self.head = head;
        Ok(())
    }
}

/// Append-only, hash-chained audit log on disk.
///
/// With `fsync` set every append is written and synced before it returns.
/// Without it lines are buffered until `flush` or until the buffer fills.
pub struct FileAuditSink {
    path: PathBuf,
    fsync: bool,
    state: Mutex<FileState>,
}

impl FileAuditSink {
    pub fn open(path: impl AsRef<Path>, fsync: bool) -> PitbossResult<Self> {
        let path = path.as_ref().to_path_buf();
        let io_err = |what: &str, e: std::io::Error| {
            PitbossError::internal(format!("failed to {what} audit log '{}': {e}", path.display()))
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_err("create directory for", e))?;
        }

        let existing = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(io_err("read", e)),
        };

        // Keep everything up to and including the last newline.
        let keep = existing.rfind('\n').map_or(0, |i| i + 1);
        if keep < existing.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = existing.len() - keep,
                "audit log ends with a torn line; truncating"
            );
        }

        let head = walk(existing[..keep].lines()).map_err(|brk| {
            PitbossError::internal(format!("audit log '{}' fails verification: {brk}", path.display()))
        })?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_err("open", e))?;
        if keep < existing.len() {
            file.set_len(keep as u64).map_err(|e| io_err("truncate", e))?;
        }

        info!(path = %path.display(), next_sequence = head.next_sequence, fsync, "audit log opened");
        Ok(Self {
            path,
            fsync,
            state: Mutex::new(FileState { file, pending: Vec::new(), durable_len: keep as u64, head }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Verify a log on disk without opening it for writing.
    pub fn verify_file(path: impl AsRef<Path>) -> PitbossResult<Option<ChainBreak>> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            PitbossError::internal(format!("failed to read audit log '{}': {e}", path.display()))
        })?;
        Ok(walk(contents.lines()).err())
    }
}

impl AuditSink for FileAuditSink {
    fn append(&self, entry: &AuditEntry) -> PitbossResult<String> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| PitbossError::internal(format!("audit state lock poisoned: {e}")))?;

        let mut head = state.head.clone();
        let (record, line) = seal(entry, &mut head)?;

        let write_err = |e: std::io::Error| {
            PitbossError::internal(format!("failed to append to audit log '{}': {e}", self.path.display()))
        };
        state.push_line(&line, head, self.fsync).map_err(write_err)?;
        if self.fsync {
            state.file.sync().map_err(write_err)?;
        }

        debug!(sequence = record.sequence, action = %record.action, outcome = %record.outcome, "audit record appended");
        Ok(record.this_hash)
    }

    fn flush(&self) -> PitbossResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| PitbossError::internal(format!("audit state lock poisoned: {e}")))?;
        let flush_err = |e: std::io::Error| {
            PitbossError::internal(format!("failed to flush audit log '{}': {e}", self.path.display()))
        };
        state.write_pending().map_err(flush_err)?;
        state.file.sync().map_err(flush_err)?;
        Ok(())
    }
}
