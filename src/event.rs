//! Event records, tag slicing, and domain event encoding.
//!
//! This module provides the data types and pure functions that the journal,
//! the entity runtime, and projections all depend on. No I/O occurs here.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::command::CommandContext;

/// Fixed namespace UUID for deterministic entity hashing.
///
/// Entity UUIDs are v5 values derived from this namespace and the
/// `"{entity_type}/{entity_id}"` string, so every node maps the same entity
/// to the same shard and tag slice.
const ENTITY_NAMESPACE: Uuid = Uuid::from_bytes([
    0x9a, 0x1e, 0x7c, 0x3b, 0x4d, 0x2f, 0x4a, 0x8e, 0xb5, 0x6c, 0x1f, 0x3d, 0x7e, 0x9a, 0x0b, 0xc4,
]);

/// Derive a deterministic UUID from entity type and entity ID.
///
/// # Examples
///
/// ```
/// use shopping_cart_es::entity_uuid;
/// let id = entity_uuid("ShoppingCart", "cart-1");
/// assert_eq!(id, entity_uuid("ShoppingCart", "cart-1")); // deterministic
/// ```
pub fn entity_uuid(entity_type: &str, entity_id: &str) -> Uuid {
    let name = format!("{entity_type}/{entity_id}");
    Uuid::new_v5(&ENTITY_NAMESPACE, name.as_bytes())
}

/// Stable bucket in `0..buckets` for an entity.
///
/// Used for both shard selection and tag slicing. Returns 0 when
/// `buckets` is 0.
pub fn bucket_for(entity_type: &str, entity_id: &str, buckets: u32) -> u32 {
    if buckets == 0 {
        return 0;
    }
    (entity_uuid(entity_type, entity_id).as_u128() % u128::from(buckets)) as u32
}

/// Tag attached to every event of `entity_id`: `"<prefix>-<slice>"`.
///
/// All events of one entity share a tag, so a consumer of that tag sees
/// them in append order.
pub fn tag_for<A: Aggregate>(entity_id: &str, slices: u32) -> String {
    let slice = bucket_for(A::AGGREGATE_TYPE, entity_id, slices);
    format!("{}-{slice}", A::TAG_PREFIX)
}

/// Every tag an aggregate type can produce with `slices` slices.
///
/// Used to start one projection consumer per tag.
pub fn tags_for<A: Aggregate>(slices: u32) -> Vec<String> {
    (0..slices).map(|s| format!("{}-{s}", A::TAG_PREFIX)).collect()
}

/// An event ready to be appended, before the log assigns positions.
///
/// Produced by [`encode_domain_event`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Event type tag extracted from the adjacently-tagged domain event.
    pub event_type: String,
    /// JSON payload (the `"data"` portion of the adjacently-tagged enum).
    pub payload: Value,
    /// Actor, correlation ID, and caller metadata. `Null` when empty.
    pub metadata: Value,
    /// Projection tag, if any.
    pub tag: Option<String>,
}

/// An event as stored in the log and delivered to projections.
///
/// Also the on-disk line format of the file-backed journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEvent {
    /// Zero-based position in the global log. Strictly increasing.
    pub global_position: u64,
    /// Entity type (e.g., "ShoppingCart").
    pub entity_type: String,
    /// Entity instance ID (e.g., "cart-1").
    pub entity_id: String,
    /// One-based position within the entity's stream.
    pub sequence_nr: u64,
    /// Projection tag, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Event type tag (e.g., "ItemAdded").
    pub event_type: String,
    /// Domain event payload.
    #[serde(default)]
    pub payload: Value,
    /// Actor, correlation ID, and caller metadata.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    /// Append time (Unix epoch milliseconds).
    pub recorded_at: u64,
}

/// Encode a domain event into a [`NewEvent`] ready for appending.
///
/// The `DomainEvent` must use `#[serde(tag = "type", content = "data")]`
/// adjacently tagged serialization. The `"type"` field becomes
/// [`NewEvent::event_type`] and the `"data"` field becomes the payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the domain event cannot be serialized or
/// does not serialize to an adjacently tagged object.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
    ctx: &CommandContext,
    tag: Option<String>,
) -> serde_json::Result<NewEvent> {
    // {"type": "CheckedOut", "data": {...}}
    let value = serde_json::to_value(event)?;
    let Some(obj) = value.as_object() else {
        return Err(serde::ser::Error::custom(
            "domain event must serialize to an adjacently tagged object",
        ));
    };
    let Some(event_type) = obj.get("type").and_then(Value::as_str) else {
        return Err(serde::ser::Error::custom(
            "domain event is missing a string 'type' field",
        ));
    };

    Ok(NewEvent {
        event_type: event_type.to_string(),
        // Absent for unit variants.
        payload: obj.get("data").cloned().unwrap_or(Value::Null),
        metadata: ctx.event_metadata(),
        tag,
    })
}

/// Decode a persisted event back into the aggregate's domain event.
///
/// Reconstructs the adjacently tagged JSON object from `event_type` and
/// `payload`, then deserializes it.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event type is unknown to the aggregate
/// or the payload does not match the variant's shape.
pub fn decode_domain_event<A: Aggregate>(
    event: &PersistedEvent,
) -> serde_json::Result<A::DomainEvent> {
    let tagged = if event.payload.is_null() {
        serde_json::json!({ "type": event.event_type })
    } else {
        serde_json::json!({ "type": event.event_type, "data": event.payload })
    };
    serde_json::from_value(tagged)
}
