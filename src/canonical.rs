//! The canonical log: one canonical JSON event per line, append-only.
//!
//! The log is the source of truth for a workspace. Appends are flushed to
//! stable storage before they are reported; readers stream lines lazily from
//! any byte offset that sits on a line boundary.
//!
//! The log is not safe for concurrent writers. Exclusive access comes from
//! the workspace lock, see [`crate::lock`].

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

use crate::dedupe::canonical_json;
use crate::error::{OpsError, Result};
use crate::models::EventRecord;

/// Byte range a record occupies in the log, newline included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSpan {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub span: LogSpan,
    pub record: EventRecord,
}

pub struct CanonicalLog {
    path: PathBuf,
    file: File,
    len: u64,
    poisoned: bool,
}

impl CanonicalLog {
    /// Opens (creating if needed) the log for appending.
    ///
    /// Only the lock holder may call this: a torn final line left by an
    /// interrupted append is repaired here before anything new is written.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        let confirmed = confirmed_len(&mut file, len)?;
        let mut len = len;
        if confirmed < len {
            let mut tail = Vec::with_capacity((len - confirmed) as usize);
            file.seek(SeekFrom::Start(confirmed))?;
            file.read_to_end(&mut tail)?;

            if serde_json::from_slice::<EventRecord>(&tail).is_ok() {
                // Complete record missing only its terminator.
                file.write_all(b"\n")?;
                file.sync_data()?;
                len += 1;
            } else {
                warn!(
                    path = %path.display(),
                    bytes = len - confirmed,
                    "discarding torn write at end of canonical log"
                );
                file.set_len(confirmed)?;
                file.sync_data()?;
                len = confirmed;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
            poisoned: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset one past the last confirmed line.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends one record and returns only after the bytes are durable.
    ///
    /// On failure the log is truncated back to its previous length so the
    /// next append starts on a clean line. If that repair fails too, the log
    /// refuses further appends until it is reopened.
    pub fn append(&mut self, record: &EventRecord) -> Result<LogSpan> {
        if self.poisoned {
            return Err(OpsError::CanonicalWrite(io::Error::other(
                "canonical log refused append after an unrepaired write failure",
            )));
        }

        let mut line = canonical_json(record)?;
        line.push('\n');

        let start = self.len;
        match self.write_durable(line.as_bytes()) {
            Ok(()) => {
                self.len = start + line.len() as u64;
                Ok(LogSpan {
                    start,
                    end: self.len,
                })
            }
            Err(e) => {
                self.roll_back(start);
                Err(OpsError::CanonicalWrite(e))
            }
        }
    }

    /// Cuts off whatever a failed write left past `start`. The log is
    /// poisoned when the truncation fails as well.
    fn roll_back(&mut self, start: u64) {
        if let Err(repair) = self.file.set_len(start).and_then(|_| self.file.sync_data()) {
            error!(
                path = %self.path.display(),
                error = %repair,
                "failed to truncate canonical log after write error"
            );
            self.poisoned = true;
        }
    }

    /// Swaps the file handle for a read-only one so every write and
    /// truncation fails.
    #[cfg(test)]
    pub(crate) fn break_writes(&mut self) {
        self.file = File::open(&self.path).expect("reopen canonical log read-only");
    }

    fn write_durable(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.file.write_all(bytes)?;
        self.file.flush()?;
        self.file.sync_data()
    }

    /// Streams records starting at `position`, which must be a line boundary
    /// (0, or the `end` of a previously returned span).
    pub fn read_from(&self, position: u64) -> Result<LogReader> {
        read_log(&self.path, position)
    }

    /// Highest id present in the log, 0 when empty.
    pub fn last_id(&self) -> Result<i64> {
        let mut last = 0;
        for entry in self.read_from(0)? {
            match entry {
                Ok(entry) => last = last.max(entry.record.id),
                Err(e) => warn!(error = %e, "skipping unreadable canonical line"),
            }
        }
        Ok(last)
    }

    pub fn find(&self, id: i64) -> Result<Option<EventRecord>> {
        find_in(&self.path, id)
    }
}

/// Opens a reader on a log without taking ownership of it.
///
/// Readers never need the workspace lock: a line still being written shows
/// up as a torn tail and is skipped.
pub fn read_log(path: &Path, position: u64) -> Result<LogReader> {
    LogReader::open(path, position)
}

/// Linear scan for one record. Used when the index cannot answer.
pub fn find_in(path: &Path, id: i64) -> Result<Option<EventRecord>> {
    let reader = match read_log(path, 0) {
        Ok(reader) => reader,
        Err(OpsError::Io(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    for entry in reader {
        match entry {
            Ok(entry) if entry.record.id == id => return Ok(Some(entry.record)),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "skipping unreadable canonical line"),
        }
    }
    Ok(None)
}

/// Offset just past the last newline in the file.
fn confirmed_len(file: &mut File, len: u64) -> io::Result<u64> {
    const BLOCK: u64 = 8192;
    let mut buf = vec![0u8; BLOCK as usize];
    let mut end = len;

    while end > 0 {
        let start = end.saturating_sub(BLOCK);
        let size = (end - start) as usize;
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(&mut buf[..size])?;
        if let Some(pos) = buf[..size].iter().rposition(|b| *b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }

    Ok(0)
}

/// Lazy, finite reader over the canonical log.
///
/// Re-reading is a matter of calling [`CanonicalLog::read_from`] again with
/// the last `span.end` seen. A final line without a terminator that fails to
/// parse is an incomplete write and ends the stream quietly; an unparsable
/// line anywhere else is reported as corruption.
pub struct LogReader {
    reader: BufReader<File>,
    offset: u64,
    buf: Vec<u8>,
    done: bool,
}

impl LogReader {
    fn open(path: &Path, position: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(position))?;
        Ok(Self {
            reader: BufReader::new(file),
            offset: position,
            buf: Vec::new(),
            done: false,
        })
    }
}

impl Iterator for LogReader {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            let n = match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(n) => n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            };
            if n == 0 {
                self.done = true;
                return None;
            }

            let start = self.offset;
            self.offset += n as u64;
            let terminated = self.buf.last() == Some(&b'\n');
            let line = trim_line(&self.buf);
            if line.is_empty() {
                continue;
            }

            return match serde_json::from_slice::<EventRecord>(line) {
                Ok(record) => Some(Ok(LogEntry {
                    span: LogSpan {
                        start,
                        end: self.offset,
                    },
                    record,
                })),
                Err(_) if !terminated => {
                    self.done = true;
                    None
                }
                Err(e) => Some(Err(OpsError::CanonicalCorrupt {
                    offset: start,
                    next: self.offset,
                    message: e.to_string(),
                })),
            };
        }
        None
    }
}

fn trim_line(buf: &[u8]) -> &[u8] {
    let mut end = buf.len();
    while end > 0 && buf[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    let mut start = 0;
    while start < end && buf[start].is_ascii_whitespace() {
        start += 1;
    }
    &buf[start..end]
}
