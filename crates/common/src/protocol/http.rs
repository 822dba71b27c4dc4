// Request and response bodies for the parcel notes HTTP surface.

use serde::{Deserialize, Serialize};

use crate::types::FieldNote;

/// Body of `PUT .../notes` and `POST .../sync`.
///
/// `update` is optional at the type level so a missing field can be reported
/// as a validation failure instead of a deserialization error.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<String>,
}

impl UpdateRequest {
    pub fn new(update: impl Into<String>) -> Self {
        Self { update: Some(update.into()) }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotesEnvelope {
    pub notes: Vec<FieldNote>,
}

/// Response of a two-way sync: the full post-merge state plus the notes it
/// materializes to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncResponse {
    pub state: String,
    pub data: NotesEnvelope,
}
