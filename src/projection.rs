//! Tag-sliced projections (read models) fed from the event log.
//!
//! Every aggregate event carries a tag such as `carts-3`. A
//! [`ProjectionEngine`] runs one consumer per tag; each consumer reads its
//! tag in commit order from the last committed offset and hands events to a
//! [`Projection`] one at a time. The projection commits the offset together
//! with its own write, so a crash never applies an event twice or skips one.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;
use crate::error::ProjectionError;
use crate::event::{PersistedEvent, tags_for};
use crate::journal::EventLog;
use crate::live::{LiveConfig, LiveHandle, run_tag_loop};

/// Position of one projection within one tag.
///
/// `position` is a resume token: the next global log position to read.
/// After processing the event at position N it is N + 1; 0 means nothing
/// has been processed yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionOffset {
    /// Projection name.
    pub projection: String,
    /// Tag being consumed.
    pub tag: String,
    /// Next global position to read.
    pub position: u64,
}

/// A read model fed by tagged events.
///
/// # Contract
///
/// - [`process`](Projection::process) must commit `offset` atomically with
///   whatever it writes for the event, and must commit it even for events
///   it ignores.
/// - An `Err` from `process` means nothing was committed; the same event is
///   delivered again after a backoff.
/// - Unknown event types should be ignored for forward compatibility.
#[async_trait]
pub trait Projection: Send + Sync + 'static {
    /// Stable name, part of every stored offset.
    fn name(&self) -> &'static str;

    /// Last committed offset for `tag`, or `None` to start from the beginning.
    async fn load_offset(&self, tag: &str) -> Result<Option<u64>, ProjectionError>;

    /// Apply one event and commit `offset`.
    async fn process(
        &self,
        event: &PersistedEvent,
        offset: &ProjectionOffset,
    ) -> Result<(), ProjectionError>;
}

/// Consumes one tag for one projection.
pub(crate) struct ProjectionRunner {
    projection: Arc<dyn Projection>,
    journal: Arc<dyn EventLog>,
    tag: String,
    batch_size: usize,
    /// In-memory cursor; `None` forces a reload from the projection.
    position: Option<u64>,
}

impl ProjectionRunner {
    pub(crate) fn new(
        projection: Arc<dyn Projection>,
        journal: Arc<dyn EventLog>,
        tag: String,
        batch_size: usize,
    ) -> Self {
        Self {
            projection,
            journal,
            tag,
            batch_size: batch_size.max(1),
            position: None,
        }
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Read and process up to one batch of events.
    ///
    /// Returns the number of events processed. On error the cursor is
    /// dropped, so the next call resumes from the committed offset.
    pub(crate) async fn run_batch(&mut self) -> Result<usize, ProjectionError> {
        let from = match self.position {
            Some(position) => position,
            None => {
                let position = self.projection.load_offset(&self.tag).await?.unwrap_or(0);
                tracing::debug!(
                    projection = self.projection.name(),
                    tag = %self.tag,
                    position,
                    "resuming projection"
                );
                self.position = Some(position);
                position
            }
        };

        let events = match self.journal.read_tagged(&self.tag, from, self.batch_size) {
            Ok(events) => events,
            Err(e) => {
                self.position = None;
                return Err(e.into());
            }
        };

        for event in &events {
            let offset = ProjectionOffset {
                projection: self.projection.name().to_owned(),
                tag: self.tag.clone(),
                position: event.global_position + 1,
            };
            if let Err(e) = self.projection.process(event, &offset).await {
                self.position = None;
                return Err(e);
            }
            self.position = Some(offset.position);
        }
        Ok(events.len())
    }

    /// Process batches until the tag is exhausted.
    pub(crate) async fn catch_up(&mut self) -> Result<usize, ProjectionError> {
        let mut total = 0;
        loop {
            let processed = self.run_batch().await?;
            total += processed;
            if processed < self.batch_size {
                return Ok(total);
            }
        }
    }
}

/// Drives a [`Projection`] over a fixed set of tags.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use shopping_cart_es::{
///     ItemPopularityProjection, MemoryItemPopularityStore, Persistence, ProjectionEngine,
///     ShoppingCart,
/// };
///
/// # async fn demo() -> Result<(), shopping_cart_es::ProjectionError> {
/// let persistence = Persistence::in_memory();
/// let store = Arc::new(MemoryItemPopularityStore::new());
/// let engine = ProjectionEngine::for_aggregate::<ShoppingCart>(
///     Arc::new(ItemPopularityProjection::new(store)),
///     persistence.journal.clone(),
///     5,
/// );
/// engine.catch_up().await?;
/// # Ok(())
/// # }
/// ```
pub struct ProjectionEngine {
    projection: Arc<dyn Projection>,
    journal: Arc<dyn EventLog>,
    tags: Vec<String>,
    config: LiveConfig,
}

impl std::fmt::Debug for ProjectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionEngine")
            .field("projection", &self.projection.name())
            .field("tags", &self.tags)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ProjectionEngine {
    /// Engine consuming exactly `tags`.
    pub fn new(
        projection: Arc<dyn Projection>,
        journal: Arc<dyn EventLog>,
        tags: Vec<String>,
    ) -> Self {
        Self {
            projection,
            journal,
            tags,
            config: LiveConfig::default(),
        }
    }

    /// Engine consuming every tag slice of aggregate type `A`.
    pub fn for_aggregate<A: Aggregate>(
        projection: Arc<dyn Projection>,
        journal: Arc<dyn EventLog>,
        tag_slices: u32,
    ) -> Self {
        Self::new(projection, journal, tags_for::<A>(tag_slices))
    }

    /// Replace the polling and backoff settings.
    pub fn with_live_config(mut self, config: LiveConfig) -> Self {
        self.config = config;
        self
    }

    /// Tags this engine consumes.
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    fn runner(&self, tag: &str) -> ProjectionRunner {
        ProjectionRunner::new(
            Arc::clone(&self.projection),
            Arc::clone(&self.journal),
            tag.to_owned(),
            self.config.batch_size,
        )
    }

    /// Process everything currently in the log, tag by tag.
    ///
    /// Returns the number of events processed.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProjectionError`]; tags before it keep their
    /// progress.
    pub async fn catch_up(&self) -> Result<usize, ProjectionError> {
        let mut total = 0;
        for tag in &self.tags {
            let processed = self.runner(tag).catch_up().await?;
            if processed > 0 {
                tracing::debug!(
                    projection = self.projection.name(),
                    tag = %tag,
                    processed,
                    "tag caught up"
                );
            }
            total += processed;
        }
        Ok(total)
    }

    /// Start one background consumer per tag.
    ///
    /// Must be called inside a tokio runtime. Consumers poll for new events
    /// every [`LiveConfig::poll_interval`] and retry failed events with
    /// exponential backoff until [`LiveHandle::shutdown`] is called.
    pub fn start(&self) -> LiveHandle {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let caught_up: Arc<[AtomicBool]> = self.tags.iter().map(|_| AtomicBool::new(false)).collect();

        let tasks = self
            .tags
            .iter()
            .enumerate()
            .map(|(index, tag)| {
                tokio::spawn(run_tag_loop(
                    self.runner(tag),
                    self.config.clone(),
                    Arc::clone(&caught_up),
                    index,
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        tracing::info!(
            projection = self.projection.name(),
            tags = self.tags.len(),
            "projection started"
        );
        LiveHandle::new(shutdown_tx, caught_up, tasks)
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// Records every event it is given, per tag, and can be told to fail.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub seen: Mutex<Vec<(String, u64)>>,
        pub offsets: Mutex<HashMap<String, u64>>,
        pub fail_at: Mutex<Option<u64>>,
    }

    impl Recorder {
        pub(crate) fn positions(&self) -> Vec<u64> {
            let mut seen: Vec<u64> = self.seen.lock().unwrap().iter().map(|(_, p)| *p).collect();
            seen.sort_unstable();
            seen
        }
    }

    #[async_trait]
    impl Projection for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn load_offset(&self, tag: &str) -> Result<Option<u64>, ProjectionError> {
            Ok(self.offsets.lock().unwrap().get(tag).copied())
        }

        async fn process(
            &self,
            event: &PersistedEvent,
            offset: &ProjectionOffset,
        ) -> Result<(), ProjectionError> {
            if *self.fail_at.lock().unwrap() == Some(event.global_position) {
                return Err(crate::error::StoreError::Unavailable("injected".into()).into());
            }
            self.seen
                .lock()
                .unwrap()
                .push((offset.tag.clone(), event.global_position));
            self.offsets
                .lock()
                .unwrap()
                .insert(offset.tag.clone(), offset.position);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::test_fixtures::Recorder;
    use super::*;
    use crate::event::NewEvent;
    use crate::journal::MemoryEventLog;

    fn tagged(tag: &str) -> NewEvent {
        NewEvent {
            event_type: "Incremented".into(),
            payload: Value::Null,
            metadata: Value::Null,
            tag: Some(tag.into()),
        }
    }

    /// Five events alternating between tags `t-0` and `t-1`, positions 0..5.
    fn journal() -> Arc<MemoryEventLog> {
        let log = Arc::new(MemoryEventLog::new());
        for i in 0..5u64 {
            let tag = if i % 2 == 0 { "t-0" } else { "t-1" };
            let id = format!("e-{i}");
            log.append("counter", &id, 0, vec![tagged(tag)]).unwrap();
        }
        log
    }

    #[test]
    fn offset_serializes_with_position() {
        let offset = ProjectionOffset {
            projection: "p".into(),
            tag: "t-0".into(),
            position: 7,
        };
        let json = serde_json::to_value(&offset).unwrap();
        assert_eq!(json["position"], 7);
    }

    #[tokio::test]
    async fn runner_reads_only_its_tag_in_order() {
        let recorder = Arc::new(Recorder::default());
        let mut runner = ProjectionRunner::new(recorder.clone(), journal(), "t-0".into(), 10);

        assert_eq!(runner.catch_up().await.unwrap(), 3);
        assert_eq!(recorder.positions(), vec![0, 2, 4]);
        assert_eq!(recorder.offsets.lock().unwrap()["t-0"], 5);

        // Nothing new: nothing redelivered.
        assert_eq!(runner.catch_up().await.unwrap(), 0);
        assert_eq!(recorder.positions().len(), 3);
    }

    #[tokio::test]
    async fn small_batches_still_reach_the_end() {
        let recorder = Arc::new(Recorder::default());
        let mut runner = ProjectionRunner::new(recorder.clone(), journal(), "t-0".into(), 1);
        assert_eq!(runner.batch_size(), 1);
        assert_eq!(runner.catch_up().await.unwrap(), 3);
        assert_eq!(recorder.positions(), vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn failure_stops_at_the_event_and_retries_it() {
        let recorder = Arc::new(Recorder::default());
        *recorder.fail_at.lock().unwrap() = Some(2);
        let mut runner = ProjectionRunner::new(recorder.clone(), journal(), "t-0".into(), 10);

        assert!(runner.run_batch().await.is_err());
        assert_eq!(recorder.positions(), vec![0]);

        *recorder.fail_at.lock().unwrap() = None;
        assert_eq!(runner.catch_up().await.unwrap(), 2);
        assert_eq!(recorder.positions(), vec![0, 2, 4]);
    }

    #[tokio::test]
    async fn new_runner_resumes_from_committed_offset() {
        let recorder = Arc::new(Recorder::default());
        recorder.offsets.lock().unwrap().insert("t-1".into(), 2);
        let mut runner = ProjectionRunner::new(recorder.clone(), journal(), "t-1".into(), 10);
        assert_eq!(runner.tag(), "t-1");

        assert_eq!(runner.catch_up().await.unwrap(), 1);
        assert_eq!(recorder.positions(), vec![3]);
    }

    #[tokio::test]
    async fn engine_catches_up_every_tag() {
        let recorder = Arc::new(Recorder::default());
        let engine = ProjectionEngine::new(
            recorder.clone(),
            journal(),
            vec!["t-0".into(), "t-1".into()],
        );
        assert_eq!(engine.catch_up().await.unwrap(), 5);
        assert_eq!(recorder.positions(), vec![0, 1, 2, 3, 4]);
        assert_eq!(engine.catch_up().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn engine_for_aggregate_uses_tag_slices() {
        use crate::aggregate::test_fixtures::Counter;
        let engine = ProjectionEngine::for_aggregate::<Counter>(
            Arc::new(Recorder::default()),
            Arc::new(MemoryEventLog::new()),
            3,
        );
        assert_eq!(engine.tags(), ["counter-0", "counter-1", "counter-2"]);
    }
}
