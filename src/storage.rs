//! On-disk layout and the storage bundle shared by entity instances.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::JournalError;
use crate::journal::{EventLog, FileEventLog, MemoryEventLog};
use crate::snapshot::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore};

/// Manages the on-disk directory layout of a node.
///
/// The layout follows this structure:
/// ```text
/// <base_dir>/
///     journal/
///         events.jsonl            -- the event log, one record per line
///     snapshots/
///         <entity_type>/
///             <entity_uuid>/
///                 snapshot-<seq>.json
///     projections/
///         item_popularity.json    -- read model rows plus offsets
/// ```
///
/// `StorageLayout` is cheap to clone (it wraps a single `PathBuf`).
#[derive(Debug, Clone)]
pub struct StorageLayout {
    base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a layout rooted at `base_dir`. Nothing is created on disk
    /// until a backend is opened.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the root directory of this layout.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// `<base_dir>/journal/events.jsonl`
    pub fn journal_path(&self) -> PathBuf {
        self.base_dir.join("journal").join("events.jsonl")
    }

    /// `<base_dir>/snapshots/<entity_type>/<entity_uuid>`
    pub fn snapshot_dir(&self, entity_type: &str, entity_id: &str) -> PathBuf {
        crate::snapshot::entity_snapshot_dir(&self.base_dir, entity_type, entity_id)
    }

    /// `<base_dir>/projections`
    pub fn projections_dir(&self) -> PathBuf {
        self.base_dir.join("projections")
    }

    /// `<base_dir>/projections/<name>.json`
    pub fn read_store_path(&self, name: &str) -> PathBuf {
        self.projections_dir().join(format!("{name}.json"))
    }
}

/// Event log and snapshot store shared by every entity instance of a node.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct Persistence {
    /// The event log.
    pub journal: Arc<dyn EventLog>,
    /// The snapshot store.
    pub snapshots: Arc<dyn SnapshotStore>,
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence").finish_non_exhaustive()
    }
}

impl Persistence {
    /// Combine an explicit log and snapshot store.
    pub fn new(journal: Arc<dyn EventLog>, snapshots: Arc<dyn SnapshotStore>) -> Self {
        Self { journal, snapshots }
    }

    /// Volatile storage, for tests and single-process demos.
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryEventLog::new()),
            Arc::new(MemorySnapshotStore::new()),
        )
    }

    /// File-backed storage following `layout`.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] if the journal cannot be opened or is corrupt.
    pub fn open(layout: &StorageLayout) -> Result<Self, JournalError> {
        let journal = FileEventLog::open(layout.journal_path())?;
        Ok(Self::new(
            Arc::new(journal),
            Arc::new(FileSnapshotStore::new(layout.base_dir())),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NewEvent;
    use crate::snapshot::Snapshot;

    #[test]
    fn layout_paths() {
        let layout = StorageLayout::new("/data/shop");
        assert_eq!(
            layout.journal_path(),
            PathBuf::from("/data/shop/journal/events.jsonl")
        );
        assert_eq!(
            layout.read_store_path("item_popularity"),
            PathBuf::from("/data/shop/projections/item_popularity.json")
        );
        assert!(
            layout
                .snapshot_dir("ShoppingCart", "cart-1")
                .starts_with("/data/shop/snapshots/ShoppingCart")
        );
    }

    #[test]
    fn open_creates_journal_and_uses_layout_for_snapshots() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let layout = StorageLayout::new(tmp.path());
        let persistence = Persistence::open(&layout).expect("open");

        persistence
            .journal
            .append(
                "counter",
                "c-1",
                0,
                vec![NewEvent {
                    event_type: "Incremented".into(),
                    payload: serde_json::Value::Null,
                    metadata: serde_json::Value::Null,
                    tag: None,
                }],
            )
            .unwrap();
        assert!(layout.journal_path().exists());

        persistence
            .snapshots
            .save(
                "counter",
                &Snapshot {
                    entity_id: "c-1".into(),
                    sequence_nr: 1,
                    state: serde_json::json!({"value": 1}),
                },
            )
            .unwrap();
        assert!(layout.snapshot_dir("counter", "c-1").is_dir());
    }
}
