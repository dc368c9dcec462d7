//! Byte-offset tailing of one append-only log file.
//!
//! Each pass reads exactly the bytes appended since the last pass. A file
//! that shrank was rotated or truncated, so the cursor restarts at zero. An
//! unterminated trailing line stays unconsumed until its newline arrives.

use fs_err as fs;
use fs_err::File;
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::PathBuf;
use tracing::{debug, info, warn};

const MAX_CHUNK_BYTES: u64 = 1 << 20;

/// Persisted read position for one watched file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailCursor {
    pub file_path: PathBuf,
    pub byte_offset: u64,
    pub last_line_seen: Option<String>,
    pub file_size_at_last_read: u64,
}

impl TailCursor {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            byte_offset: 0,
            last_line_seen: None,
            file_size_at_last_read: 0,
        }
    }

    fn reset(&mut self) {
        self.byte_offset = 0;
        self.last_line_seen = None;
        self.file_size_at_last_read = 0;
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TailOutcome {
    pub lines: Vec<String>,
    /// The cursor was reset to zero during this pass.
    pub truncated: bool,
    /// More appended bytes remain beyond the chunk limit.
    pub more: bool,
}

#[derive(Debug)]
pub struct FileTailer {
    cursor: TailCursor,
    verify_on_next_pass: bool,
    max_chunk: u64,
}

impl FileTailer {
    /// Tailer for a file never seen before, reading from the start.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            cursor: TailCursor::new(path),
            verify_on_next_pass: false,
            max_chunk: MAX_CHUNK_BYTES,
        }
    }

    /// Tailer for a file never seen before that skips its current content.
    pub fn at_end(path: impl Into<PathBuf>) -> io::Result<Self> {
        let mut tailer = Self::new(path);
        match fs::metadata(&tailer.cursor.file_path) {
            Ok(metadata) => {
                tailer.cursor.byte_offset = metadata.len();
                tailer.cursor.file_size_at_last_read = metadata.len();
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        Ok(tailer)
    }

    /// Resumes from a persisted cursor. The first pass checks that the
    /// remembered last line still sits right before the offset; if it does
    /// not, the file was replaced and reading restarts at zero.
    pub fn resume(cursor: TailCursor) -> Self {
        Self {
            verify_on_next_pass: cursor.byte_offset > 0 && cursor.last_line_seen.is_some(),
            cursor,
            max_chunk: MAX_CHUNK_BYTES,
        }
    }

    #[cfg(test)]
    pub fn with_max_chunk(mut self, max_chunk: u64) -> Self {
        self.max_chunk = max_chunk.max(1);
        self
    }

    pub fn cursor(&self) -> &TailCursor {
        &self.cursor
    }

    pub fn poll(&mut self) -> io::Result<TailOutcome> {
        let size = match fs::metadata(&self.cursor.file_path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(TailOutcome::default());
            }
            Err(err) => return Err(err),
        };

        let mut outcome = TailOutcome::default();

        if size < self.cursor.byte_offset {
            info!(
                path = %self.cursor.file_path.display(),
                offset = self.cursor.byte_offset,
                size,
                "Log file shrank; restarting from the beginning"
            );
            self.cursor.reset();
            self.verify_on_next_pass = false;
            outcome.truncated = true;
        }

        if self.verify_on_next_pass {
            self.verify_on_next_pass = false;
            if !self.resume_point_matches()? {
                warn!(
                    path = %self.cursor.file_path.display(),
                    offset = self.cursor.byte_offset,
                    "Saved cursor does not match file content; restarting from the beginning"
                );
                self.cursor.reset();
                outcome.truncated = true;
            }
        }

        if size == self.cursor.byte_offset {
            self.cursor.file_size_at_last_read = size;
            return Ok(outcome);
        }

        let pending = size - self.cursor.byte_offset;
        let want = pending.min(self.max_chunk);
        let mut file = File::open(&self.cursor.file_path)?;
        file.seek(SeekFrom::Start(self.cursor.byte_offset))?;
        let mut buffer = Vec::with_capacity(want as usize);
        file.take(want).read_to_end(&mut buffer)?;

        let consumed = match buffer.iter().rposition(|byte| *byte == b'\n') {
            Some(last_newline) => last_newline + 1,
            // A full chunk without any newline is one oversized line.
            None if buffer.len() as u64 == self.max_chunk => buffer.len(),
            None => {
                debug!(
                    path = %self.cursor.file_path.display(),
                    bytes = buffer.len(),
                    "Waiting for line terminator"
                );
                self.cursor.file_size_at_last_read = size;
                return Ok(outcome);
            }
        };

        for raw in buffer[..consumed].split(|byte| *byte == b'\n') {
            let line = String::from_utf8_lossy(raw);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                outcome.lines.push(line.to_string());
            }
        }

        self.cursor.byte_offset += consumed as u64;
        self.cursor.file_size_at_last_read = size;
        if let Some(last) = outcome.lines.last() {
            self.cursor.last_line_seen = Some(last.clone());
        }
        outcome.more = self.cursor.byte_offset < size && want < pending;

        Ok(outcome)
    }

    fn resume_point_matches(&self) -> io::Result<bool> {
        let Some(last_line) = &self.cursor.last_line_seen else {
            return Ok(true);
        };

        let window = last_line.len() as u64 + 2;
        let start = self.cursor.byte_offset.saturating_sub(window);
        let mut file = File::open(&self.cursor.file_path)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buffer = Vec::new();
        file.take(self.cursor.byte_offset - start)
            .read_to_end(&mut buffer)?;

        let tail = String::from_utf8_lossy(&buffer);
        let Some(tail) = tail.strip_suffix('\n') else {
            // Oversized lines are consumed without a terminator.
            return Ok(tail.ends_with(last_line.as_str()));
        };
        Ok(tail.trim_end_matches('\r').ends_with(last_line.as_str()))
    }
}
