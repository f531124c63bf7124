//! Cross-cutting command metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit trail, correlation, and the command's wall-clock time
/// without polluting the `Command` or `DomainEvent` types. Actor and
/// correlation ID are copied into every persisted event's metadata.
///
/// # Examples
///
/// ```
/// use shopping_cart_es::CommandContext;
/// use serde_json::json;
///
/// let ctx = CommandContext::default()
///     .with_actor("user-42")
///     .with_correlation_id("req-abc-123")
///     .with_metadata(json!({"source": "api"}));
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id.as_deref(), Some("req-abc-123"));
/// assert!(ctx.metadata.is_some());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the actor issuing the command (e.g. a user ID).
    pub actor: Option<String>,
    /// Correlation ID for tracing a request across entities.
    pub correlation_id: Option<String>,
    /// Arbitrary metadata merged into the persisted event metadata.
    pub metadata: Option<Value>,
    /// Time the command was issued. `None` means "now" at handling time.
    pub issued_at: Option<DateTime<Utc>>,
}

impl CommandContext {
    /// Set the actor identity.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the correlation ID.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set arbitrary metadata.
    pub fn with_metadata(mut self, meta: Value) -> Self {
        self.metadata = Some(meta);
        self
    }

    /// Pin the command's wall-clock time.
    ///
    /// Handlers that record timestamps (e.g. checkout) read it through
    /// [`issued_at`](CommandContext::issued_at), so a pinned value makes
    /// their output deterministic.
    pub fn with_issued_at(mut self, at: DateTime<Utc>) -> Self {
        self.issued_at = Some(at);
        self
    }

    /// The pinned issue time, or the current time when none was set.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at.unwrap_or_else(Utc::now)
    }

    /// Build the JSON metadata object stamped on persisted events.
    ///
    /// Starts from `metadata` (when it is an object) and adds `actor` and
    /// `correlation_id`. Returns `Value::Null` when nothing would be set.
    pub(crate) fn event_metadata(&self) -> Value {
        let mut map = match self.metadata {
            Some(Value::Object(ref map)) => map.clone(),
            _ => serde_json::Map::new(),
        };
        if let Some(ref actor) = self.actor {
            map.insert("actor".to_string(), Value::String(actor.clone()));
        }
        if let Some(ref cid) = self.correlation_id {
            map.insert("correlation_id".to_string(), Value::String(cid.clone()));
        }
        if map.is_empty() {
            Value::Null
        } else {
            Value::Object(map)
        }
    }
}
