//! Event records, event streams, and the typed encode/decode bridge.
//!
//! Domain events cross the pipeline as untyped [`EventRecord`]s inside an
//! [`EventStream`], so the store, committing, and publishing layers stay
//! independent of concrete aggregate types. The functions here convert
//! between adjacently-tagged domain events and that untyped form. No I/O
//! occurs in this module.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::Aggregate;

/// A single domain event in its untyped, pipeline-facing form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Client-assigned event id, generated at encode time.
    pub event_id: Uuid,
    /// Event type tag extracted from the adjacently-tagged domain event
    /// (e.g. "Deposited").
    pub event_type: String,
    /// JSON payload (the `"data"` portion of the adjacently-tagged enum);
    /// `null` for fieldless variants.
    pub payload: Value,
}

/// The ordered, immutable batch of events produced by one command
/// execution for one aggregate-version transition.
///
/// Tagged with the producing command id, the target aggregate identity,
/// the target version, and a creation timestamp. Never mutated after
/// being handed to the committing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventStream {
    /// Target aggregate instance identifier.
    pub aggregate_id: String,
    /// Target aggregate type name (matches `Aggregate::AGGREGATE_TYPE`).
    pub aggregate_type: String,
    /// Id of the command whose execution produced this stream. Each
    /// command id commits at most once per aggregate.
    pub command_id: String,
    /// Target version: exactly one greater than the aggregate's version
    /// before this command executed. Versions start at 1.
    pub version: u64,
    /// Creation time, Unix epoch milliseconds.
    pub timestamp: i64,
    /// The ordered domain events.
    pub events: Vec<EventRecord>,
}

impl EventStream {
    /// Build a stream from already-encoded records, stamping the current
    /// time.
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        command_id: impl Into<String>,
        version: u64,
        events: Vec<EventRecord>,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            command_id: command_id.into(),
            version,
            timestamp: chrono::Utc::now().timestamp_millis(),
            events,
        }
    }
}

/// Encode typed domain events into [`EventRecord`]s.
///
/// Serializes each adjacently-tagged domain event
/// (`#[serde(tag = "type", content = "data")]`), extracts the `"type"` and
/// `"data"` fields, and generates a fresh UUID v4 event id.
///
/// # Errors
///
/// Returns `serde_json::Error` if a domain event cannot be serialized.
pub fn encode_domain_events<A: Aggregate>(
    events: &[A::DomainEvent],
) -> serde_json::Result<Vec<EventRecord>> {
    events
        .iter()
        .map(|event| {
            // Serialize the adjacently-tagged domain event. This produces
            // JSON like:
            //   {"type": "Opened"}                       (unit variant)
            //   {"type": "Deposited", "data": {...}}     (variant with fields)
            let value = serde_json::to_value(event)?;
            let obj = value
                .as_object()
                .expect("adjacently tagged enum must serialize to a JSON object");

            let event_type = obj["type"]
                .as_str()
                .expect("adjacently tagged enum must have a string 'type' field")
                .to_string();

            // Absent for fieldless variants, so default to null.
            let payload = obj.get("data").cloned().unwrap_or(Value::Null);

            Ok(EventRecord {
                event_id: Uuid::new_v4(),
                event_type,
                payload,
            })
        })
        .collect()
}

/// Decode an [`EventRecord`] back into a typed domain event.
///
/// Reconstructs the adjacently-tagged JSON object from the record's type
/// tag and payload. Returns `None` for unknown or malformed event types,
/// which callers skip for forward compatibility.
pub fn decode_domain_event<A: Aggregate>(record: &EventRecord) -> Option<A::DomainEvent> {
    let tagged = if record.payload.is_null() {
        serde_json::json!({ "type": record.event_type })
    } else {
        serde_json::json!({
            "type": record.event_type,
            "data": record.payload,
        })
    };
    serde_json::from_value::<A::DomainEvent>(tagged).ok()
}

/// Fold a sequence of committed streams into typed aggregate state.
///
/// Returns the rebuilt state and the version of the last stream applied
/// (0 when `streams` is empty). Unknown event records are skipped.
pub fn fold_streams<A: Aggregate>(streams: &[EventStream]) -> (A, u64) {
    let mut state = A::default();
    let mut version = 0;
    for stream in streams {
        for record in &stream.events {
            if let Some(event) = decode_domain_event::<A>(record) {
                state = state.apply(&event);
            }
        }
        version = stream.version;
    }
    (state, version)
}
