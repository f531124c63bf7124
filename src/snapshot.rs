//! Snapshot persistence and retention for entity state.
//!
//! File snapshots are stored as JSON at
//! `<base_dir>/snapshots/<entity_type>/<entity_uuid>/snapshot-<seq>.json`.
//! Writes are atomic via a temp-rename pattern to prevent corruption
//! from crashes mid-write.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event::entity_uuid;

/// A point-in-time snapshot of an entity's state.
///
/// `sequence_nr` records the last event folded into `state`, so recovery
/// replays from `sequence_nr + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<S = Value> {
    /// Entity instance ID.
    pub entity_id: String,
    /// Sequence number of the last event included in `state`.
    pub sequence_nr: u64,
    /// The entity state.
    pub state: S,
}

/// When to snapshot and how many snapshots to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPolicy {
    /// Snapshot whenever the sequence number crosses a multiple of this
    /// value. `0` disables snapshots.
    pub every: u64,
    /// Snapshots retained per entity after each save.
    pub keep: usize,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            every: 100,
            keep: 3,
        }
    }
}

impl SnapshotPolicy {
    /// Whether persisting events `previous + 1 ..= current` crossed a
    /// snapshot boundary.
    pub fn should_snapshot(&self, previous: u64, current: u64) -> bool {
        self.every > 0 && current / self.every > previous / self.every
    }
}

/// Storage for entity snapshots.
///
/// State is stored as opaque JSON; the runtime converts to and from the
/// aggregate type. Implementations must treat an unreadable snapshot as a
/// cache miss and fall back to older ones.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Persist a snapshot.
    fn save(&self, entity_type: &str, snapshot: &Snapshot) -> io::Result<()>;

    /// The newest readable snapshot of an entity, if any.
    ///
    /// # Errors
    ///
    /// Only unexpected I/O failures (e.g. permission denied).
    fn load_latest(&self, entity_type: &str, entity_id: &str) -> io::Result<Option<Snapshot>>;

    /// Delete all but the newest `keep` snapshots. Returns how many were
    /// removed.
    fn prune(&self, entity_type: &str, entity_id: &str, keep: usize) -> io::Result<usize>;
}

/// Volatile [`SnapshotStore`].
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<(String, String), BTreeMap<u64, Snapshot>>>,
}

impl MemorySnapshotStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence numbers of the stored snapshots for an entity, ascending.
    pub fn sequence_nrs(&self, entity_type: &str, entity_id: &str) -> Vec<u64> {
        let map = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&(entity_type.to_owned(), entity_id.to_owned()))
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save(&self, entity_type: &str, snapshot: &Snapshot) -> io::Result<()> {
        let mut map = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        map.entry((entity_type.to_owned(), snapshot.entity_id.clone()))
            .or_default()
            .insert(snapshot.sequence_nr, snapshot.clone());
        Ok(())
    }

    fn load_latest(&self, entity_type: &str, entity_id: &str) -> io::Result<Option<Snapshot>> {
        let map = self.snapshots.read().unwrap_or_else(PoisonError::into_inner);
        Ok(map
            .get(&(entity_type.to_owned(), entity_id.to_owned()))
            .and_then(|s| s.values().next_back().cloned()))
    }

    fn prune(&self, entity_type: &str, entity_id: &str, keep: usize) -> io::Result<usize> {
        let mut map = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        let Some(snaps) = map.get_mut(&(entity_type.to_owned(), entity_id.to_owned())) else {
            return Ok(0);
        };
        let excess = snaps.len().saturating_sub(keep);
        let doomed: Vec<u64> = snaps.keys().take(excess).copied().collect();
        for seq in &doomed {
            snaps.remove(seq);
        }
        Ok(doomed.len())
    }
}

/// [`SnapshotStore`] backed by one JSON file per snapshot.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    base_dir: PathBuf,
}

impl FileSnapshotStore {
    /// Store snapshots under `<base_dir>/snapshots`.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Directory holding one entity's snapshots.
    ///
    /// Entity IDs are arbitrary strings, so the directory is named by the
    /// entity's UUID rather than the raw ID.
    pub fn entity_dir(&self, entity_type: &str, entity_id: &str) -> PathBuf {
        entity_snapshot_dir(&self.base_dir, entity_type, entity_id)
    }

    /// Stored snapshot files for an entity, newest first.
    fn list(&self, entity_type: &str, entity_id: &str) -> io::Result<Vec<(u64, PathBuf)>> {
        let dir = self.entity_dir(entity_type, entity_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let seq = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("snapshot-"))
                .and_then(|n| n.strip_suffix(".json"))
                .and_then(|n| n.parse::<u64>().ok());
            if let Some(seq) = seq {
                files.push((seq, path));
            }
        }
        files.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(files)
    }
}

/// `<base_dir>/snapshots/<entity_type>/<entity_uuid>`
pub fn entity_snapshot_dir(base_dir: &Path, entity_type: &str, entity_id: &str) -> PathBuf {
    base_dir
        .join("snapshots")
        .join(entity_type)
        .join(entity_uuid(entity_type, entity_id).to_string())
}

impl SnapshotStore for FileSnapshotStore {
    fn save(&self, entity_type: &str, snapshot: &Snapshot) -> io::Result<()> {
        let dir = self.entity_dir(entity_type, &snapshot.entity_id);
        std::fs::create_dir_all(&dir)?;

        let path = dir.join(format!("snapshot-{:020}.json", snapshot.sequence_nr));
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    fn load_latest(&self, entity_type: &str, entity_id: &str) -> io::Result<Option<Snapshot>> {
        for (seq, path) in self.list(entity_type, entity_id)? {
            let bytes = match std::fs::read(&path) {
                Ok(b) => b,
                // Pruned concurrently.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snap) if snap.entity_id == entity_id && snap.sequence_nr == seq => {
                    return Ok(Some(snap));
                }
                Ok(_) => {
                    tracing::warn!(
                        path = %path.display(),
                        "snapshot does not match its file name; trying an older one"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "failed to deserialize snapshot; trying an older one"
                    );
                }
            }
        }
        Ok(None)
    }

    fn prune(&self, entity_type: &str, entity_id: &str, keep: usize) -> io::Result<usize> {
        let mut removed = 0;
        for (_, path) in self.list(entity_type, entity_id)?.into_iter().skip(keep) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}
