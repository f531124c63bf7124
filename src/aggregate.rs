//! Aggregate trait: the decision and evolution logic of one entity type.

use serde::{Serialize, de::DeserializeOwned};

use crate::command::CommandContext;

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the [`apply`](Aggregate::apply) method.
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the set of events this aggregate can produce and apply.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O, no side effects.
///   It validates a command against the current state and returns zero or more events.
///   Returning `Ok(vec![])` makes the command a read: nothing is persisted and the
///   caller receives the current state.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes ownership of
///   the current state and a reference to a domain event, returning the next state.
pub trait Aggregate:
    Default + Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "ShoppingCart"). Part of every
    /// stream key and snapshot path.
    const AGGREGATE_TYPE: &'static str;

    /// Prefix of the projection tags attached to this aggregate's events.
    const TAG_PREFIX: &'static str = Self::AGGREGATE_TYPE;

    /// The set of commands this aggregate can handle.
    type Command: Send + 'static;

    /// The set of events this aggregate can produce and apply.
    ///
    /// Must use `#[serde(tag = "type", content = "data")]`.
    type DomainEvent: Serialize
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + Clone
        + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate a command against the current state and produce events.
    ///
    /// `entity_id` is the ID of the instance handling the command.
    /// Returns `Err` to reject the command.
    fn handle(
        &self,
        entity_id: &str,
        cmd: Self::Command,
        ctx: &CommandContext,
    ) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}
