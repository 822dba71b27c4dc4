// Replicated note document: the yrs-backed document, the record validator
// and the transport codec for update blobs.

pub mod codec;
pub mod note_doc;
pub mod validate;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CrdtError {
    #[error("update text is empty")]
    EmptyUpdate,
    #[error("update text is not valid base64: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    #[error("update payload could not be decoded: {0}")]
    InvalidUpdate(String),
    #[error("state vector could not be decoded: {0}")]
    InvalidStateVector(String),
    #[error("update could not be merged: {0}")]
    Merge(String),
}
