//! Append-only event log with per-entity streams and tag queries.
//!
//! Two backends share one in-memory index:
//!
//! - [`MemoryEventLog`] keeps everything in process memory.
//! - [`FileEventLog`] additionally writes every record as one JSON line to
//!   `<base_dir>/journal/events.jsonl` and fsyncs before acknowledging. On
//!   open, a torn trailing line (a crash mid-write) is truncated; any other
//!   unreadable line is reported as corruption.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use crate::error::JournalError;
use crate::event::{NewEvent, PersistedEvent};

/// Durable, totally ordered store of events.
///
/// Implementations must guarantee:
///
/// - An append is atomic: either every event of the batch is stored with
///   consecutive sequence numbers and global positions, or none is.
/// - Appends are rejected with [`JournalError::SequenceConflict`] unless the
///   stream's highest sequence number equals `expected_sequence_nr`.
/// - Reads return events in ascending order.
pub trait EventLog: Send + Sync + 'static {
    /// Append `events` to the stream of `(entity_type, entity_id)`.
    ///
    /// `expected_sequence_nr` is the highest sequence number the writer has
    /// observed (0 for a new stream). The first event is stored with
    /// `expected_sequence_nr + 1`.
    ///
    /// # Errors
    ///
    /// [`JournalError::SequenceConflict`], [`JournalError::EmptyAppend`], or
    /// a backend failure.
    fn append(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_sequence_nr: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<PersistedEvent>, JournalError>;

    /// Events of one stream with `sequence_nr > after_sequence_nr`.
    fn read_stream(
        &self,
        entity_type: &str,
        entity_id: &str,
        after_sequence_nr: u64,
    ) -> Result<Vec<PersistedEvent>, JournalError>;

    /// Up to `limit` events carrying `tag`, with
    /// `global_position >= from_position`, in global order.
    fn read_tagged(
        &self,
        tag: &str,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<PersistedEvent>, JournalError>;

    /// Up to `limit` events of any stream with
    /// `global_position >= from_position`.
    fn read_all(&self, from_position: u64, limit: usize)
    -> Result<Vec<PersistedEvent>, JournalError>;

    /// Highest stored sequence number of a stream (0 when empty).
    fn highest_sequence_nr(&self, entity_type: &str, entity_id: &str)
    -> Result<u64, JournalError>;
}

type StreamKey = (String, String);

/// Position index shared by both backends.
#[derive(Debug, Default)]
struct Index {
    events: Vec<PersistedEvent>,
    streams: HashMap<StreamKey, Vec<usize>>,
    tags: HashMap<String, Vec<usize>>,
}

impl Index {
    fn highest_sequence_nr(&self, entity_type: &str, entity_id: &str) -> u64 {
        self.streams
            .get(&(entity_type.to_owned(), entity_id.to_owned()))
            .and_then(|ix| ix.last())
            .map(|&i| self.events[i].sequence_nr)
            .unwrap_or(0)
    }

    /// Assign positions to a batch without mutating the index.
    fn stage(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_sequence_nr: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<PersistedEvent>, JournalError> {
        if events.is_empty() {
            return Err(JournalError::EmptyAppend);
        }
        let actual = self.highest_sequence_nr(entity_type, entity_id);
        if actual != expected_sequence_nr {
            return Err(JournalError::SequenceConflict {
                stream: format!("{entity_type}/{entity_id}"),
                expected: expected_sequence_nr,
                actual,
            });
        }

        let base = self.events.len() as u64;
        let recorded_at = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Ok(events
            .into_iter()
            .enumerate()
            .map(|(i, e)| PersistedEvent {
                global_position: base + i as u64,
                entity_type: entity_type.to_owned(),
                entity_id: entity_id.to_owned(),
                sequence_nr: expected_sequence_nr + 1 + i as u64,
                tag: e.tag,
                event_type: e.event_type,
                payload: e.payload,
                metadata: e.metadata,
                recorded_at,
            })
            .collect())
    }

    fn commit(&mut self, records: &[PersistedEvent]) {
        for record in records {
            let i = self.events.len();
            self.streams
                .entry((record.entity_type.clone(), record.entity_id.clone()))
                .or_default()
                .push(i);
            if let Some(ref tag) = record.tag {
                self.tags.entry(tag.clone()).or_default().push(i);
            }
            self.events.push(record.clone());
        }
    }

    /// Insert a record read back from disk, checking ordering invariants.
    fn restore(&mut self, record: PersistedEvent, line: usize) -> Result<(), JournalError> {
        let expected_position = self.events.len() as u64;
        if record.global_position != expected_position {
            return Err(JournalError::Corrupt {
                line,
                reason: format!(
                    "global position {} out of order (expected {expected_position})",
                    record.global_position
                ),
            });
        }
        let expected_seq = self.highest_sequence_nr(&record.entity_type, &record.entity_id) + 1;
        if record.sequence_nr != expected_seq {
            return Err(JournalError::Corrupt {
                line,
                reason: format!(
                    "sequence number {} of {}/{} out of order (expected {expected_seq})",
                    record.sequence_nr, record.entity_type, record.entity_id
                ),
            });
        }
        self.commit(std::slice::from_ref(&record));
        Ok(())
    }

    fn read_stream(&self, entity_type: &str, entity_id: &str, after: u64) -> Vec<PersistedEvent> {
        let Some(ix) = self
            .streams
            .get(&(entity_type.to_owned(), entity_id.to_owned()))
        else {
            return Vec::new();
        };
        // Sequence numbers are 1-based and contiguous, so `after` is also
        // the number of events to skip.
        ix.iter()
            .skip(after.min(ix.len() as u64) as usize)
            .map(|&i| self.events[i].clone())
            .collect()
    }

    fn read_tagged(&self, tag: &str, from: u64, limit: usize) -> Vec<PersistedEvent> {
        let Some(ix) = self.tags.get(tag) else {
            return Vec::new();
        };
        let start = ix.partition_point(|&i| (i as u64) < from);
        ix[start..]
            .iter()
            .take(limit)
            .map(|&i| self.events[i].clone())
            .collect()
    }

    fn read_all(&self, from: u64, limit: usize) -> Vec<PersistedEvent> {
        self.events
            .iter()
            .skip(from.min(self.events.len() as u64) as usize)
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Volatile [`EventLog`] for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    index: RwLock<Index>,
}

impl MemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventLog for MemoryEventLog {
    fn append(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_sequence_nr: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<PersistedEvent>, JournalError> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let records = index.stage(entity_type, entity_id, expected_sequence_nr, events)?;
        index.commit(&records);
        Ok(records)
    }

    fn read_stream(
        &self,
        entity_type: &str,
        entity_id: &str,
        after_sequence_nr: u64,
    ) -> Result<Vec<PersistedEvent>, JournalError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.read_stream(entity_type, entity_id, after_sequence_nr))
    }

    fn read_tagged(
        &self,
        tag: &str,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<PersistedEvent>, JournalError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.read_tagged(tag, from_position, limit))
    }

    fn read_all(
        &self,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<PersistedEvent>, JournalError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.read_all(from_position, limit))
    }

    fn highest_sequence_nr(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<u64, JournalError> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        Ok(index.highest_sequence_nr(entity_type, entity_id))
    }
}

struct FileState {
    file: File,
    len: u64,
    index: Index,
}

/// [`EventLog`] persisted as a JSON-lines file.
///
/// The whole log is indexed in memory on open; reads never touch disk.
pub struct FileEventLog {
    path: PathBuf,
    state: RwLock<FileState>,
    // Serializes writers so the file and the index advance together.
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for FileEventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEventLog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl FileEventLog {
    /// Open (or create) the journal file at `path`.
    ///
    /// Parent directories are created as needed. Existing records are read
    /// into the in-memory index.
    ///
    /// # Errors
    ///
    /// - [`JournalError::Corrupt`] if a record other than a torn trailing
    ///   line cannot be parsed or violates ordering.
    /// - [`JournalError::Io`] on filesystem failures.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let bytes = std::fs::read(&path)?;
        let mut index = Index::default();
        let mut valid_len = 0usize;
        let mut needs_newline = false;

        // Work on raw bytes: a torn tail may end inside a multibyte character.
        for (line_no, chunk) in bytes.split_inclusive(|b| *b == b'\n').enumerate() {
            let terminated = chunk.ends_with(b"\n");
            let line = chunk
                .strip_suffix(b"\n")
                .map_or(chunk, |l| l.strip_suffix(b"\r").unwrap_or(l));
            if line.iter().all(u8::is_ascii_whitespace) {
                valid_len += chunk.len();
                continue;
            }
            match serde_json::from_slice::<PersistedEvent>(line) {
                Ok(record) => {
                    index.restore(record, line_no + 1)?;
                    valid_len += chunk.len();
                    needs_newline = !terminated;
                }
                Err(e) if !terminated => {
                    tracing::warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "truncating torn trailing journal record"
                    );
                    break;
                }
                Err(e) => {
                    return Err(JournalError::Corrupt {
                        line: line_no + 1,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if valid_len < bytes.len() {
            file.set_len(valid_len as u64)?;
        }
        if needs_newline {
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        let len = file.metadata()?.len();

        tracing::debug!(
            path = %path.display(),
            events = index.events.len(),
            "journal opened"
        );
        Ok(Self {
            path,
            state: RwLock::new(FileState { file, len, index }),
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the journal file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventLog for FileEventLog {
    fn append(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_sequence_nr: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<PersistedEvent>, JournalError> {
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let records = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            state
                .index
                .stage(entity_type, entity_id, expected_sequence_nr, events)?
        };

        let mut buf = Vec::new();
        for record in &records {
            serde_json::to_writer(&mut buf, record).map_err(JournalError::Encode)?;
            buf.push(b'\n');
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let written = state
            .file
            .write_all(&buf)
            .and_then(|()| state.file.sync_data());
        if let Err(e) = written {
            // Drop any partial batch so the next append starts on a clean line.
            let len = state.len;
            if let Err(trunc) = state.file.set_len(len) {
                tracing::error!(error = %trunc, "failed to roll back partial journal write");
            }
            return Err(e.into());
        }
        state.len += buf.len() as u64;
        state.index.commit(&records);
        Ok(records)
    }

    fn read_stream(
        &self,
        entity_type: &str,
        entity_id: &str,
        after_sequence_nr: u64,
    ) -> Result<Vec<PersistedEvent>, JournalError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .index
            .read_stream(entity_type, entity_id, after_sequence_nr))
    }

    fn read_tagged(
        &self,
        tag: &str,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<PersistedEvent>, JournalError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.index.read_tagged(tag, from_position, limit))
    }

    fn read_all(
        &self,
        from_position: u64,
        limit: usize,
    ) -> Result<Vec<PersistedEvent>, JournalError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.index.read_all(from_position, limit))
    }

    fn highest_sequence_nr(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<u64, JournalError> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        Ok(state.index.highest_sequence_nr(entity_type, entity_id))
    }
}
