//! Item popularity: a versioned read store fed by cart events.
//!
//! Rows are keyed by item ID and carry an optimistic-locking version. The
//! store commits a row write and the projection offset that produced it in
//! one operation, which makes redelivered events harmless: a write whose
//! offset is not ahead of the committed one is dropped.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::cart::{CartEvent, ShoppingCart};
use crate::error::{ProjectionError, StoreError};
use crate::event::{PersistedEvent, decode_domain_event};
use crate::projection::{Projection, ProjectionOffset};

/// Read-modify-write attempts per event before giving up for this round.
const DEFAULT_CONFLICT_RETRIES: u32 = 5;

/// How often an item has been added to carts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPopularity {
    pub item_id: String,
    /// Incremented by the store on every successful save.
    pub version: u64,
    /// Sum of all quantities added.
    pub count: i64,
}

impl ItemPopularity {
    /// A row that has never been saved.
    pub fn new(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            version: 0,
            count: 0,
        }
    }

    /// Same row with `delta` added to the count. The version is unchanged.
    pub fn change_count(self, delta: i64) -> Self {
        Self {
            count: self.count + delta,
            ..self
        }
    }
}

/// Versioned key-value store for [`ItemPopularity`] rows plus projection
/// offsets.
#[async_trait]
pub trait ItemPopularityStore: Send + Sync + 'static {
    /// Current row for `item_id`.
    async fn find_by_id(&self, item_id: &str) -> Result<Option<ItemPopularity>, StoreError>;

    /// Save `row` and commit `offset` in one operation.
    ///
    /// `row.version` must equal the stored version (0 for a new row); the
    /// stored version becomes `row.version + 1`. Returns `Ok(None)` without
    /// writing when `offset` is not ahead of the committed offset.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] when the row changed since it was read.
    async fn save(
        &self,
        row: ItemPopularity,
        offset: &ProjectionOffset,
    ) -> Result<Option<ItemPopularity>, StoreError>;

    /// Commit `offset` alone. Never moves an offset backwards.
    async fn save_offset(&self, offset: &ProjectionOffset) -> Result<(), StoreError>;

    /// Committed position of `projection` within `tag`.
    async fn load_offset(&self, projection: &str, tag: &str) -> Result<Option<u64>, StoreError>;
}

/// Rows and offsets, shared by both backends.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    rows: BTreeMap<String, ItemPopularity>,
    offsets: Vec<ProjectionOffset>,
}

impl Tables {
    fn offset(&self, projection: &str, tag: &str) -> Option<u64> {
        self.offsets
            .iter()
            .find(|o| o.projection == projection && o.tag == tag)
            .map(|o| o.position)
    }

    fn is_stale(&self, offset: &ProjectionOffset) -> bool {
        self.offset(&offset.projection, &offset.tag)
            .is_some_and(|committed| committed >= offset.position)
    }

    fn commit_offset(&mut self, offset: &ProjectionOffset) {
        match self
            .offsets
            .iter_mut()
            .find(|o| o.projection == offset.projection && o.tag == offset.tag)
        {
            Some(existing) => existing.position = existing.position.max(offset.position),
            None => self.offsets.push(offset.clone()),
        }
    }

    fn save(
        &mut self,
        row: ItemPopularity,
        offset: &ProjectionOffset,
    ) -> Result<Option<ItemPopularity>, StoreError> {
        if self.is_stale(offset) {
            return Ok(None);
        }
        let current = self.rows.get(&row.item_id).map_or(0, |r| r.version);
        if current != row.version {
            return Err(StoreError::Conflict {
                key: row.item_id,
                expected: row.version,
                actual: current,
            });
        }
        let saved = ItemPopularity {
            version: row.version + 1,
            ..row
        };
        self.rows.insert(saved.item_id.clone(), saved.clone());
        self.commit_offset(offset);
        Ok(Some(saved))
    }
}

/// Volatile [`ItemPopularityStore`], for tests and single-process demos.
#[derive(Debug, Default)]
pub struct MemoryItemPopularityStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl MemoryItemPopularityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with [`StoreError::Unavailable`] until
    /// called again with `false`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    fn tables(&self) -> Result<std::sync::MutexGuard<'_, Tables>, StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("store marked unavailable".into()));
        }
        Ok(self.tables.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl ItemPopularityStore for MemoryItemPopularityStore {
    async fn find_by_id(&self, item_id: &str) -> Result<Option<ItemPopularity>, StoreError> {
        Ok(self.tables()?.rows.get(item_id).cloned())
    }

    async fn save(
        &self,
        row: ItemPopularity,
        offset: &ProjectionOffset,
    ) -> Result<Option<ItemPopularity>, StoreError> {
        self.tables()?.save(row, offset)
    }

    async fn save_offset(&self, offset: &ProjectionOffset) -> Result<(), StoreError> {
        self.tables()?.commit_offset(offset);
        Ok(())
    }

    async fn load_offset(&self, projection: &str, tag: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.tables()?.offset(projection, tag))
    }
}

/// [`ItemPopularityStore`] persisted as a single JSON file.
///
/// Every write rewrites the file through a temp-file rename, so a crash
/// leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileItemPopularityStore {
    path: PathBuf,
    tables: Mutex<Tables>,
}

impl FileItemPopularityStore {
    /// Open the store at `path`, creating it on first write.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let tables = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt read store {}: {e}", path.display()),
                )
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            path,
            tables: Mutex::new(tables),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` to a copy of the tables, persist the copy, and only
    /// then make it current.
    fn write<T>(
        &self,
        change: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = tables.clone();
        let out = change(&mut next)?;
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let json = serde_json::to_string_pretty(&next).map_err(io::Error::other)?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        *tables = next;
        Ok(out)
    }

    fn read(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ItemPopularityStore for FileItemPopularityStore {
    async fn find_by_id(&self, item_id: &str) -> Result<Option<ItemPopularity>, StoreError> {
        Ok(self.read().rows.get(item_id).cloned())
    }

    async fn save(
        &self,
        row: ItemPopularity,
        offset: &ProjectionOffset,
    ) -> Result<Option<ItemPopularity>, StoreError> {
        if self.read().is_stale(offset) {
            return Ok(None);
        }
        self.write(|tables| tables.save(row, offset))
    }

    async fn save_offset(&self, offset: &ProjectionOffset) -> Result<(), StoreError> {
        if self.read().is_stale(offset) {
            return Ok(());
        }
        self.write(|tables| {
            tables.commit_offset(offset);
            Ok(())
        })
    }

    async fn load_offset(&self, projection: &str, tag: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.read().offset(projection, tag))
    }
}

/// Keeps [`ItemPopularity`] rows in step with `ItemAdded` events.
pub struct ItemPopularityProjection {
    store: Arc<dyn ItemPopularityStore>,
    conflict_retries: u32,
}

impl std::fmt::Debug for ItemPopularityProjection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemPopularityProjection")
            .field("conflict_retries", &self.conflict_retries)
            .finish_non_exhaustive()
    }
}

impl ItemPopularityProjection {
    /// Name under which offsets are stored.
    pub const NAME: &'static str = "item-popularity";

    pub fn new(store: Arc<dyn ItemPopularityStore>) -> Self {
        Self {
            store,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
        }
    }

    /// Attempts per event when the row keeps changing underneath.
    pub fn with_conflict_retries(mut self, attempts: u32) -> Self {
        self.conflict_retries = attempts.max(1);
        self
    }

    async fn add_quantity(
        &self,
        item_id: &str,
        quantity: i64,
        offset: &ProjectionOffset,
    ) -> Result<(), ProjectionError> {
        for attempt in 1..=self.conflict_retries {
            let row = self
                .store
                .find_by_id(item_id)
                .await?
                .unwrap_or_else(|| ItemPopularity::new(item_id))
                .change_count(quantity);
            match self.store.save(row, offset).await {
                Ok(Some(saved)) => {
                    tracing::info!(
                        tag = %offset.tag,
                        item_id,
                        count = saved.count,
                        "item popularity updated"
                    );
                    return Ok(());
                }
                Ok(None) => {
                    tracing::debug!(
                        tag = %offset.tag,
                        position = offset.position,
                        "event already applied"
                    );
                    return Ok(());
                }
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!(item_id, attempt, "version conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!(item_id, attempts = self.conflict_retries, "conflict retries exhausted");
        Err(ProjectionError::ConflictRetriesExhausted {
            key: item_id.to_owned(),
            attempts: self.conflict_retries,
        })
    }
}

#[async_trait]
impl Projection for ItemPopularityProjection {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn load_offset(&self, tag: &str) -> Result<Option<u64>, ProjectionError> {
        Ok(self.store.load_offset(Self::NAME, tag).await?)
    }

    async fn process(
        &self,
        event: &PersistedEvent,
        offset: &ProjectionOffset,
    ) -> Result<(), ProjectionError> {
        if event.entity_type != ShoppingCart::AGGREGATE_TYPE {
            return Ok(self.store.save_offset(offset).await?);
        }
        match decode_domain_event::<ShoppingCart>(event) {
            Ok(CartEvent::ItemAdded {
                item_id, quantity, ..
            }) => {
                self.add_quantity(&item_id, i64::from(quantity), offset)
                    .await
            }
            Ok(CartEvent::CheckedOut { .. }) => Ok(self.store.save_offset(offset).await?),
            Err(e) => {
                tracing::warn!(
                    global_position = event.global_position,
                    event_type = %event.event_type,
                    error = %e,
                    "skipping undecodable cart event"
                );
                Ok(self.store.save_offset(offset).await?)
            }
        }
    }
}
