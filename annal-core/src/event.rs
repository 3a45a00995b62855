//! Domain event envelope and the per-aggregate event contract.
//!
//! Events are immutable facts appended to exactly one entity's stream. The
//! store keeps them as kind-tagged JSON values; ordering within a stream is
//! the append order and is authoritative for projection folding.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

/// Event materialized in a stream, with its position and envelope metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Stream (aggregate instance) the event belongs to.
    pub stream_id: Uuid,
    /// Aggregate kind owning the stream, e.g. `"session"` or `"user"`.
    pub aggregate: String,
    /// Zero-based position within the stream; strictly increasing in
    /// append order.
    pub sequence: u64,
    /// Event kind tag, matching [`AggregateEvent::kind`].
    pub kind: String,
    /// Serialized event payload.
    pub data: serde_json::Value,
    /// When the store committed the event.
    pub recorded_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Decode the payload back into the aggregate's event sum type.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error if the payload does not match the
    /// event enum's shape.
    pub fn decode<E: AggregateEvent>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// Sum type of all events that can appear in one aggregate's streams.
///
/// Each aggregate defines a single enum implementing this trait; the store
/// serializes the whole enum (internally tagged) so replay can decode any
/// event in the stream without per-kind dispatch tables.
pub trait AggregateEvent: Serialize + DeserializeOwned + Send + Sync {
    /// Aggregate kind identifier, shared by every event of the aggregate.
    ///
    /// Lowercase, kebab-case: `"session"`, `"user"`.
    const AGGREGATE: &'static str;

    /// Kind tag of this specific event, used for the stored envelope and
    /// structured logging.
    fn kind(&self) -> &'static str;
}
