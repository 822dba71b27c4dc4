// Core domain types shared across all FieldNotes crates.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Display name used when a stored note does not say who wrote it.
pub const UNKNOWN_AUTHOR: &str = "Unknown";

/// A free-text note attached to a property parcel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FieldNote {
    pub id: String,
    pub parcel_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    /// Display name of the author.
    pub created_by: String,
    /// Owner reference in the user directory.
    pub user_id: i64,
}

impl FieldNote {
    /// Build a note with a fresh id stamped at the current time.
    pub fn new(
        parcel_id: impl Into<String>,
        text: impl Into<String>,
        created_by: impl Into<String>,
        user_id: i64,
    ) -> Self {
        Self {
            id: new_note_id(),
            parcel_id: parcel_id.into(),
            text: text.into(),
            created_at: now_millis(),
            created_by: created_by.into(),
            user_id,
        }
    }
}

pub fn new_note_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time at the millisecond precision notes are stored with.
pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}
