// Validate-or-synthesize conversion between stored note values and
// `FieldNote`. Never fails: anything missing or malformed is replaced with a
// fallback and reported as a repair so callers can log and count it.
//
// A missing id is replaced by one derived from the entry's position in the
// operation log, so every read and every replica agrees on it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;
use yrs::Any;

use crate::types::{now_millis, FieldNote, UNKNOWN_AUTHOR};

/// Namespace for ids derived from array entries.
const ENTRY_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1d_2c4e_93a7_4b0e_8d52_f1e0_7a39_c6b4);

/// Largest integer an `f64` holds exactly.
const MAX_EXACT_F64_INT: i64 = 1 << 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairedField {
    /// The stored value was not an object at all.
    Shape,
    Id,
    ParcelId,
    Text,
    CreatedAt,
    CreatedBy,
    UserId,
}

impl RepairedField {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shape => "shape",
            Self::Id => "id",
            Self::ParcelId => "parcelId",
            Self::Text => "text",
            Self::CreatedAt => "createdAt",
            Self::CreatedBy => "createdBy",
            Self::UserId => "userId",
        }
    }
}

impl fmt::Display for RepairedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedNote {
    pub note: FieldNote,
    pub repairs: Vec<RepairedField>,
}

impl ValidatedNote {
    pub fn is_clean(&self) -> bool {
        self.repairs.is_empty()
    }
}

/// A repair made while materializing one array entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteRepair {
    pub index: usize,
    pub note_id: String,
    pub fields: Vec<RepairedField>,
}

/// Id for an entry that carries none, derived from the entry's element id
/// (`client`, `clock`) in the document's operation log.
pub fn entry_note_id(parcel_id: &str, client: u64, clock: u32) -> String {
    let name = format!("{parcel_id}/{client}/{clock}");
    Uuid::new_v5(&ENTRY_ID_NAMESPACE, name.as_bytes()).to_string()
}

/// Accepts the object shape written by [`note_to_any`] and the legacy shape
/// where the whole record was stored as a JSON string. `fallback_id` is only
/// called when the value has no usable id.
pub fn note_from_any<F>(parcel_id: &str, value: &Any, fallback_id: F) -> ValidatedNote
where
    F: FnOnce() -> String,
{
    match value {
        Any::Map(fields) => note_from_fields(parcel_id, fields, fallback_id),
        Any::String(raw) => match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Object(object)) => {
                let fields = object
                    .iter()
                    .map(|(key, value)| (key.clone(), json_to_any(value)))
                    .collect::<HashMap<_, _>>();
                note_from_fields(parcel_id, &fields, fallback_id)
            }
            _ => synthesize(parcel_id, fallback_id),
        },
        _ => synthesize(parcel_id, fallback_id),
    }
}

pub fn note_to_any(note: &FieldNote) -> Any {
    let mut fields = HashMap::with_capacity(6);
    fields.insert("id".to_owned(), Any::String(Arc::from(note.id.as_str())));
    fields.insert("parcelId".to_owned(), Any::String(Arc::from(note.parcel_id.as_str())));
    fields.insert("text".to_owned(), Any::String(Arc::from(note.text.as_str())));
    fields.insert(
        "createdAt".to_owned(),
        Any::String(Arc::from(note.created_at.to_rfc3339_opts(SecondsFormat::Millis, true))),
    );
    fields.insert("createdBy".to_owned(), Any::String(Arc::from(note.created_by.as_str())));
    fields.insert("userId".to_owned(), user_id_to_any(note.user_id));
    Any::Map(Arc::new(fields))
}

fn note_from_fields<F>(parcel_id: &str, fields: &HashMap<String, Any>, fallback_id: F) -> ValidatedNote
where
    F: FnOnce() -> String,
{
    let mut repairs = Vec::new();

    let id = match fields.get("id") {
        Some(Any::String(value)) if !value.trim().is_empty() => value.to_string(),
        Some(Any::Number(value)) if value.is_finite() => format_number_id(*value),
        Some(Any::BigInt(value)) => value.to_string(),
        _ => {
            repairs.push(RepairedField::Id);
            fallback_id()
        }
    };

    match fields.get("parcelId") {
        Some(Any::String(value)) if value.as_ref() == parcel_id => {}
        _ => repairs.push(RepairedField::ParcelId),
    }

    let text = match fields.get("text") {
        Some(Any::String(value)) => value.to_string(),
        _ => {
            repairs.push(RepairedField::Text);
            String::new()
        }
    };

    let created_at = match fields.get("createdAt").and_then(parse_timestamp) {
        Some(timestamp) => timestamp,
        None => {
            repairs.push(RepairedField::CreatedAt);
            now_millis()
        }
    };

    let created_by = match fields.get("createdBy") {
        Some(Any::String(value)) if !value.trim().is_empty() => value.to_string(),
        _ => {
            repairs.push(RepairedField::CreatedBy);
            UNKNOWN_AUTHOR.to_owned()
        }
    };

    let user_id = match fields.get("userId").and_then(parse_user_id) {
        Some(user_id) => user_id,
        None => {
            repairs.push(RepairedField::UserId);
            0
        }
    };

    ValidatedNote {
        note: FieldNote { id, parcel_id: parcel_id.to_owned(), text, created_at, created_by, user_id },
        repairs,
    }
}

fn synthesize<F>(parcel_id: &str, fallback_id: F) -> ValidatedNote
where
    F: FnOnce() -> String,
{
    ValidatedNote {
        note: FieldNote {
            id: fallback_id(),
            parcel_id: parcel_id.to_owned(),
            text: String::new(),
            created_at: now_millis(),
            created_by: UNKNOWN_AUTHOR.to_owned(),
            user_id: 0,
        },
        repairs: vec![RepairedField::Shape],
    }
}

fn parse_timestamp(value: &Any) -> Option<DateTime<Utc>> {
    match value {
        Any::String(raw) => {
            DateTime::parse_from_rfc3339(raw.trim()).ok().map(|ts| ts.with_timezone(&Utc))
        }
        // Epoch milliseconds, as produced by `Date.now()`.
        Any::Number(millis) if millis.is_finite() => {
            DateTime::from_timestamp_millis(*millis as i64)
        }
        Any::BigInt(millis) => DateTime::from_timestamp_millis(*millis),
        _ => None,
    }
}

fn parse_user_id(value: &Any) -> Option<i64> {
    match value {
        Any::Number(number) if number.is_finite() && number.fract() == 0.0 => {
            Some(*number as i64)
        }
        Any::BigInt(number) => Some(*number),
        Any::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }
}

// Ids past 2^53 would lose digits as a Yjs number.
fn user_id_to_any(user_id: i64) -> Any {
    if (-MAX_EXACT_F64_INT..=MAX_EXACT_F64_INT).contains(&user_id) {
        Any::Number(user_id as f64)
    } else {
        Any::BigInt(user_id)
    }
}

fn format_number_id(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

fn json_to_any(value: &serde_json::Value) -> Any {
    match value {
        serde_json::Value::Null => Any::Null,
        serde_json::Value::Bool(flag) => Any::Bool(*flag),
        serde_json::Value::Number(number) => match number.as_i64() {
            Some(int) => Any::BigInt(int),
            None => Any::Number(number.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(text) => Any::String(Arc::from(text.as_str())),
        serde_json::Value::Array(items) => {
            Any::Array(items.iter().map(json_to_any).collect::<Vec<_>>().into())
        }
        serde_json::Value::Object(object) => Any::Map(Arc::new(
            object.iter().map(|(key, value)| (key.clone(), json_to_any(value))).collect(),
        )),
    }
}
