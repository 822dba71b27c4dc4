// Transport codec for update blobs.
//
// Updates travel as standard (padded) base64 text inside JSON bodies. Only
// `apply` touches a document; `encode`/`decode` are pure conversions.

use base64::{engine::general_purpose::STANDARD, Engine};

use super::note_doc::NoteDocument;
use super::CrdtError;

/// Full document state as transport text.
pub fn encode(doc: &NoteDocument) -> String {
    encode_bytes(&doc.encode_state())
}

pub fn encode_bytes(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

/// Transport text back to update bytes. Does not apply anything.
pub fn decode(text: &str) -> Result<Vec<u8>, CrdtError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(CrdtError::EmptyUpdate);
    }
    Ok(STANDARD.decode(trimmed)?)
}

/// Decode `text` and merge it into `doc`. Fails before any mutation when the
/// text or the update inside it is malformed.
pub fn apply(doc: &NoteDocument, text: &str) -> Result<(), CrdtError> {
    let payload = decode(text)?;
    doc.apply_update(&payload)
}

pub fn encode_state_vector(doc: &NoteDocument) -> String {
    encode_bytes(&doc.encode_state_vector())
}

/// Changes `doc` has that a replica at `state_vector` is missing.
pub fn encode_diff(doc: &NoteDocument, state_vector: &str) -> Result<String, CrdtError> {
    let sv = decode(state_vector)?;
    Ok(encode_bytes(&doc.encode_diff(&sv)?))
}

/// Run a local edit and return just the update it produced, ready to ship.
pub fn capture<F, R>(doc: &NoteDocument, edit: F) -> (R, String)
where
    F: FnOnce(&NoteDocument) -> R,
{
    let before = doc.encode_state_vector();
    let result = edit(doc);
    // The state vector was produced by this document a moment ago.
    let diff = doc.encode_diff(&before).unwrap_or_else(|_| doc.encode_state());
    (result, encode_bytes(&diff))
}
