//! Rebuild entity state from the latest snapshot plus the event tail.

use crate::aggregate::Aggregate;
use crate::error::RecoveryError;
use crate::event::decode_domain_event;
use crate::journal::EventLog;
use crate::snapshot::SnapshotStore;

/// Result of a successful recovery.
#[derive(Debug, Clone)]
pub struct Recovered<A> {
    /// State after folding every stored event.
    pub state: A,
    /// Highest sequence number folded into `state` (0 for a new entity).
    pub sequence_nr: u64,
    /// Sequence number of the snapshot recovery started from, if any.
    pub from_snapshot: Option<u64>,
    /// Number of events replayed on top of the snapshot.
    pub replayed: usize,
}

/// Recover the state of `entity_id`.
///
/// Loads the newest readable snapshot (a snapshot whose state no longer
/// deserializes is treated as absent) and folds every later event through
/// [`Aggregate::apply`].
///
/// # Errors
///
/// - [`RecoveryError::Snapshot`] when the snapshot store fails with I/O.
/// - [`RecoveryError::Journal`] when the event log cannot be read.
/// - [`RecoveryError::Decode`] when a stored event does not decode.
/// - [`RecoveryError::SequenceGap`] when the stream is not contiguous.
pub fn recover<A: Aggregate>(
    journal: &dyn EventLog,
    snapshots: &dyn SnapshotStore,
    entity_id: &str,
) -> Result<Recovered<A>, RecoveryError> {
    let snapshot = snapshots
        .load_latest(A::AGGREGATE_TYPE, entity_id)
        .map_err(|source| RecoveryError::Snapshot {
            entity_id: entity_id.to_owned(),
            source,
        })?;

    let (mut state, mut sequence_nr, from_snapshot) = match snapshot {
        Some(snap) => match serde_json::from_value::<A>(snap.state) {
            Ok(state) => (state, snap.sequence_nr, Some(snap.sequence_nr)),
            Err(e) => {
                tracing::warn!(
                    entity_type = A::AGGREGATE_TYPE,
                    entity_id,
                    sequence_nr = snap.sequence_nr,
                    error = %e,
                    "snapshot state no longer deserializes; replaying full history"
                );
                (A::default(), 0, None)
            }
        },
        None => (A::default(), 0, None),
    };

    let events = journal
        .read_stream(A::AGGREGATE_TYPE, entity_id, sequence_nr)
        .map_err(|source| RecoveryError::Journal {
            entity_id: entity_id.to_owned(),
            source,
        })?;
    let replayed = events.len();

    for event in &events {
        let expected = sequence_nr + 1;
        if event.sequence_nr != expected {
            return Err(RecoveryError::SequenceGap {
                entity_id: entity_id.to_owned(),
                expected,
                found: event.sequence_nr,
            });
        }
        let domain_event =
            decode_domain_event::<A>(event).map_err(|source| RecoveryError::Decode {
                entity_id: entity_id.to_owned(),
                sequence_nr: event.sequence_nr,
                source,
            })?;
        state = state.apply(&domain_event);
        sequence_nr = expected;
    }

    tracing::debug!(
        entity_type = A::AGGREGATE_TYPE,
        entity_id,
        sequence_nr,
        replayed,
        "entity recovered"
    );
    Ok(Recovered {
        state,
        sequence_nr,
        from_snapshot,
        replayed,
    })
}
