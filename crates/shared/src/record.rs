use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{Event, EventId, UserId},
    error::RecordError,
};

pub const FIELD_TITLE: &str = "title";
pub const FIELD_DATE: &str = "date";
pub const FIELD_DESCRIPTION: &str = "description";
pub const FIELD_OWNER_ID: &str = "ownerId";

/// A stored document as the store pushes it: an opaque id plus loosely typed
/// fields. Field contents are only validated when a document is materialized
/// into an [`Event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: String,
    pub fields: Value,
}

impl RawDocument {
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// Write payload for a new event record. Carries the owner because creation
/// is the only moment `ownerId` is ever written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub title: String,
    pub date: DateTime<Utc>,
    pub description: String,
    pub owner_id: UserId,
}

/// Partial update payload. Deliberately has no owner field: `ownerId` is
/// immutable and must never appear in an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPatch {
    pub title: String,
    pub date: DateTime<Utc>,
    pub description: String,
}

/// Materializes a pushed document into an [`Event`].
///
/// Reads are lenient the way the store's own client reads are: a missing
/// `date` defaults to now, missing string fields default to empty. A field
/// that is present with the wrong type fails this one record.
pub fn parse_event(doc: &RawDocument) -> Result<Event, RecordError> {
    let fields = doc.fields.as_object().ok_or(RecordError::NotAnObject)?;

    let title = string_field(fields, FIELD_TITLE)?;
    let description = string_field(fields, FIELD_DESCRIPTION)?;
    let owner_id = string_field(fields, FIELD_OWNER_ID)?;

    let date = match fields.get(FIELD_DATE) {
        None | Some(Value::Null) => Utc::now(),
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|_| RecordError::BadTimestamp { value: raw.clone() })?,
        Some(_) => return Err(RecordError::FieldType { field: FIELD_DATE }),
    };

    Ok(Event {
        id: EventId::new(doc.id.clone()),
        title,
        date,
        description,
        owner_id: UserId::new(owner_id),
    })
}

fn string_field(
    fields: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, RecordError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(RecordError::FieldType { field }),
    }
}
