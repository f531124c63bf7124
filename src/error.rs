//! Crate-level error types for the event log, entity runtime, and projections.

use std::io;
use std::time::Duration;

/// Error returned by an [`EventLog`](crate::EventLog) backend.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    /// The stream's highest sequence number differs from the one the writer
    /// expected. Another writer appended to the same entity, so the caller's
    /// in-memory state is stale.
    #[error("sequence conflict on stream '{stream}': expected {expected}, found {actual}")]
    SequenceConflict {
        /// `<entity_type>/<entity_id>` of the conflicting stream.
        stream: String,
        /// Sequence number the writer believed was the latest.
        expected: u64,
        /// Sequence number actually stored.
        actual: u64,
    },

    /// Attempted to append an empty batch.
    #[error("cannot append an empty event batch")]
    EmptyAppend,

    /// A stored record could not be parsed or violates ordering.
    #[error("corrupt journal record at line {line}: {reason}")]
    Corrupt {
        /// One-based line number in the journal file (0 when not file-backed).
        line: usize,
        /// What was wrong with the record.
        reason: String,
    },

    /// A domain event could not be serialized into a journal record.
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Error raised while rebuilding an entity's state from snapshot and log.
///
/// Recovery failure is fatal for the entity instance: it never starts from
/// an empty state in place of an unreadable history.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// The event log could not be read.
    #[error("failed to read events of '{entity_id}': {source}")]
    Journal {
        /// Entity being recovered.
        entity_id: String,
        /// Underlying log error.
        #[source]
        source: JournalError,
    },

    /// A persisted event does not decode into the aggregate's event type.
    #[error("event {sequence_nr} of '{entity_id}' could not be decoded: {source}")]
    Decode {
        /// Entity being recovered.
        entity_id: String,
        /// Sequence number of the offending event.
        sequence_nr: u64,
        /// Deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// The replayed events are not contiguous.
    #[error("sequence gap in '{entity_id}': expected {expected}, found {found}")]
    SequenceGap {
        /// Entity being recovered.
        entity_id: String,
        /// Sequence number that should have come next.
        expected: u64,
        /// Sequence number found instead.
        found: u64,
    },

    /// The snapshot store failed with an I/O error (not a corrupt file).
    #[error("snapshot store unreadable for '{entity_id}': {source}")]
    Snapshot {
        /// Entity being recovered.
        entity_id: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// Error returned when executing a command against an entity fails.
///
/// Generic over `E`, the domain-specific rejection type produced by the
/// aggregate's command handler.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// Command rejected by aggregate logic. Nothing was persisted.
    #[error(transparent)]
    Domain(E),

    /// Events could not be appended. The entity instance restarts from its
    /// last durable state; the command may be retried.
    #[error("failed to persist events: {0}")]
    Persistence(#[source] JournalError),

    /// The entity instance could not be recovered.
    #[error("entity recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    /// No node is reachable for the entity's shard.
    #[error("no route to entity '{entity_id}' (owner {owner})")]
    Unroutable {
        /// Target entity.
        entity_id: String,
        /// Node the routing table names as owner.
        owner: String,
    },

    /// The actor backing this entity exited before replying.
    #[error("entity actor is no longer running")]
    ActorGone,

    /// No reply arrived in time. The command may still take effect.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Error returned when reading the current state of an entity fails.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The entity instance could not be recovered.
    #[error("entity recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    /// No node is reachable for the entity's shard.
    #[error("no route to entity '{entity_id}' (owner {owner})")]
    Unroutable {
        /// Target entity.
        entity_id: String,
        /// Node the routing table names as owner.
        owner: String,
    },

    /// The actor backing this entity exited before replying.
    #[error("entity actor is no longer running")]
    ActorGone,

    /// No reply arrived in time.
    #[error("no reply within {0:?}")]
    Timeout(Duration),
}

/// Error returned by a read-side store such as
/// [`ItemPopularityStore`](crate::ItemPopularityStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A concurrent writer advanced the row's version.
    #[error("version conflict on '{key}': expected {expected}, found {actual}")]
    Conflict {
        /// Row key.
        key: String,
        /// Version the writer read.
        expected: u64,
        /// Version currently stored.
        actual: u64,
    },

    /// The store cannot serve requests right now.
    #[error("read store unavailable: {0}")]
    Unavailable(String),

    /// Disk I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Error raised while a projection consumes the event log.
///
/// Every variant is operational: the projection retries the same position
/// after a backoff and never skips the event.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Reading the event log failed.
    #[error("event log read failed: {0}")]
    Journal(#[from] JournalError),

    /// The read store rejected or failed the update.
    #[error("read store error: {0}")]
    Store(#[from] StoreError),

    /// Optimistic version conflicts kept recurring for one row.
    #[error("gave up on '{key}' after {attempts} conflicting updates")]
    ConflictRetriesExhausted {
        /// Row key.
        key: String,
        /// Number of read-modify-write attempts made.
        attempts: u32,
    },
}
