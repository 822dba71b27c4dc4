// Per-parcel note document backed by a yrs `Doc`.
//
// The document holds one root array, `notes`, whose elements are plain note
// objects. Clients edit their own replica and ship yrs updates; merging is
// done by yrs, and the note list is derived from the array on demand.

use std::collections::HashMap;

use yrs::branch::{Branch, BranchPtr};
use yrs::types::ToJson;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Array, ArrayRef, Assoc, Doc, Out, ReadTxn, StateVector, StickyIndex, Transact, TransactionMut,
    Update,
};

use super::validate::{entry_note_id, note_from_any, note_to_any, NoteRepair, ValidatedNote};
use super::CrdtError;
use crate::types::FieldNote;

/// Name of the root array shared with Yjs clients.
pub const NOTES_ARRAY: &str = "notes";

/// Notes derived from a document, plus every repair the validator had to make.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Materialized {
    pub notes: Vec<FieldNote>,
    pub repairs: Vec<NoteRepair>,
}

pub struct NoteDocument {
    parcel_id: String,
    doc: Doc,
}

impl NoteDocument {
    /// Create a new empty document for a parcel.
    pub fn new(parcel_id: impl Into<String>) -> Self {
        Self { parcel_id: parcel_id.into(), doc: Doc::new() }
    }

    /// Create a document with a specific client ID (for deterministic testing).
    pub fn with_client_id(parcel_id: impl Into<String>, client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { parcel_id: parcel_id.into(), doc: Doc::with_options(options) }
    }

    pub fn parcel_id(&self) -> &str {
        &self.parcel_id
    }

    /// Decode and merge a binary update. Decoding happens before the write
    /// transaction opens, so a malformed payload leaves the document untouched.
    pub fn apply_update(&self, data: &[u8]) -> Result<(), CrdtError> {
        let update =
            Update::decode_v1(data).map_err(|error| CrdtError::InvalidUpdate(error.to_string()))?;
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|error| CrdtError::Merge(error.to_string()))
    }

    /// Encode the full document state as a binary update.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the state vector (logical timestamp) for sync protocol.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Compute an update containing all changes since the given state vector.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>, CrdtError> {
        let sv = StateVector::decode_v1(remote_sv)
            .map_err(|error| CrdtError::InvalidStateVector(error.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Derive the note list.
    ///
    /// Entries sharing an id collapse into one note that keeps the position of
    /// the first entry and the content of the last one. Array order is part of
    /// the converged state, so every replica picks the same winner.
    pub fn materialize(&self) -> Materialized {
        let array = self.notes_array();
        let txn = self.doc.transact();

        let mut order = Vec::new();
        let mut latest: HashMap<String, FieldNote> = HashMap::new();
        let mut repairs = Vec::new();

        for (index, value) in array.iter(&txn).enumerate() {
            let validated = self.validate_entry(&array, &txn, index as u32, &value);
            if !validated.repairs.is_empty() {
                repairs.push(NoteRepair {
                    index,
                    note_id: validated.note.id.clone(),
                    fields: validated.repairs,
                });
            }

            let note = validated.note;
            if !latest.contains_key(&note.id) {
                order.push(note.id.clone());
            }
            latest.insert(note.id.clone(), note);
        }

        let notes = order.into_iter().filter_map(|id| latest.remove(&id)).collect();
        Materialized { notes, repairs }
    }

    pub fn notes(&self) -> Vec<FieldNote> {
        self.materialize().notes
    }

    pub fn contains_note(&self, note_id: &str) -> bool {
        self.notes().iter().any(|note| note.id == note_id)
    }

    /// Append a note record as-is.
    pub fn insert_note(&self, note: &FieldNote) {
        let array = self.notes_array();
        let mut txn = self.doc.transact_mut();
        array.push_back(&mut txn, note_to_any(note));
    }

    /// Append a batch of note records in one transaction.
    pub fn insert_notes<'a>(&self, notes: impl IntoIterator<Item = &'a FieldNote>) {
        let array = self.notes_array();
        let mut txn = self.doc.transact_mut();
        for note in notes {
            array.push_back(&mut txn, note_to_any(note));
        }
    }

    /// Create a note with a fresh id and append it.
    pub fn create_note(&self, text: &str, created_by: &str, user_id: i64) -> FieldNote {
        let note = FieldNote::new(self.parcel_id.clone(), text, created_by, user_id);
        self.insert_note(&note);
        note
    }

    /// Replace the text of a note. Returns the updated note, or `None` when
    /// the id is not present.
    pub fn update_note_text(&self, note_id: &str, text: &str) -> Option<FieldNote> {
        let array = self.notes_array();
        let mut txn = self.doc.transact_mut();

        let (positions, current) = self.find_entries(&array, &txn, note_id);
        let mut note = current?;
        let first = *positions.first()?;
        note.text = text.to_owned();

        remove_positions(&array, &mut txn, &positions);
        array.insert(&mut txn, first, note_to_any(&note));
        Some(note)
    }

    /// Remove every entry carrying `note_id`. Returns how many were removed.
    pub fn remove_note(&self, note_id: &str) -> usize {
        let array = self.notes_array();
        let mut txn = self.doc.transact_mut();

        let (positions, _) = self.find_entries(&array, &txn, note_id);
        remove_positions(&array, &mut txn, &positions);
        positions.len()
    }

    /// Rewrite every entry the validator had to repair with its repaired
    /// record, so fallback values are chosen once and shipped to every
    /// replica. Returns the repairs made.
    pub fn repair_entries(&self) -> Vec<NoteRepair> {
        let array = self.notes_array();
        let mut txn = self.doc.transact_mut();

        let mut repaired = Vec::new();
        for (index, value) in array.iter(&txn).enumerate() {
            let validated = self.validate_entry(&array, &txn, index as u32, &value);
            if !validated.is_clean() {
                repaired.push((index, validated));
            }
        }

        let mut repairs = Vec::with_capacity(repaired.len());
        for (index, validated) in repaired.into_iter().rev() {
            let position = index as u32;
            array.remove(&mut txn, position);
            array.insert(&mut txn, position, note_to_any(&validated.note));
            repairs.push(NoteRepair {
                index,
                note_id: validated.note.id,
                fields: validated.repairs,
            });
        }
        repairs.reverse();
        repairs
    }

    /// Number of raw entries in the notes array, duplicates included.
    pub fn entry_count(&self) -> u32 {
        let array = self.notes_array();
        let txn = self.doc.transact();
        array.len(&txn)
    }

    /// Validate the entry at `index`. Shared types (a Yjs `Y.Map` pushed
    /// into the array) are read through their JSON form.
    fn validate_entry<T: ReadTxn>(
        &self,
        array: &ArrayRef,
        txn: &T,
        index: u32,
        value: &Out,
    ) -> ValidatedNote {
        note_from_any(&self.parcel_id, &value.to_json(txn), || {
            self.entry_id(array, txn, index)
        })
    }

    /// Stable stand-in id for the entry at `index`: its element id in the
    /// operation log, which every replica shares.
    fn entry_id<T: ReadTxn>(&self, array: &ArrayRef, txn: &T, index: u32) -> String {
        let branch: &Branch = array.as_ref();
        let element = StickyIndex::at(txn, BranchPtr::from(branch), index, Assoc::After)
            .and_then(|position| position.id().copied());
        match element {
            Some(id) => entry_note_id(&self.parcel_id, id.client, id.clock),
            // Unreachable for an index taken from the array itself.
            None => entry_note_id(&self.parcel_id, 0, index),
        }
    }

    fn notes_array(&self) -> ArrayRef {
        self.doc.get_or_insert_array(NOTES_ARRAY)
    }

    fn find_entries<T: ReadTxn>(
        &self,
        array: &ArrayRef,
        txn: &T,
        note_id: &str,
    ) -> (Vec<u32>, Option<FieldNote>) {
        let mut positions = Vec::new();
        let mut current = None;
        for (index, value) in array.iter(txn).enumerate() {
            let validated = self.validate_entry(array, txn, index as u32, &value);
            if validated.note.id == note_id {
                positions.push(index as u32);
                current = Some(validated.note);
            }
        }
        (positions, current)
    }
}

fn remove_positions(array: &ArrayRef, txn: &mut TransactionMut, positions: &[u32]) {
    for index in positions.iter().rev() {
        array.remove(txn, *index);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::crdt::validate::RepairedField;
    use yrs::Any;

    /// Append a value the way a foreign Yjs client would, with no validation.
    fn push_raw(doc: &NoteDocument, entry: Any) {
        let array = doc.notes_array();
        let mut txn = doc.doc.transact_mut();
        array.push_back(&mut txn, entry);
    }

    fn text_only(text: &str) -> Any {
        Any::Map(Arc::new(HashMap::from([("text".to_owned(), Any::String(Arc::from(text)))])))
    }

    fn sync(source: &NoteDocument, target: &NoteDocument) {
        let sv = target.encode_state_vector();
        let diff = source.encode_diff(&sv).expect("state vector should decode");
        target.apply_update(&diff).expect("diff should apply");
    }

    #[test]
    fn new_document_has_no_notes() {
        let doc = NoteDocument::new("P1");
        assert!(doc.notes().is_empty());
        assert_eq!(doc.entry_count(), 0);
    }

    #[test]
    fn create_note_is_materialized() {
        let doc = NoteDocument::new("P1");
        let created = doc.create_note("roof inspected", "Dana", 5);

        let notes = doc.notes();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, created.id);
        assert_eq!(notes[0].text, "roof inspected");
        assert_eq!(notes[0].parcel_id, "P1");
        assert!(doc.materialize().repairs.is_empty());
    }

    #[test]
    fn update_note_text_keeps_position_and_id() {
        let doc = NoteDocument::new("P1");
        let first = doc.create_note("one", "Dana", 5);
        let second = doc.create_note("two", "Dana", 5);

        let updated = doc.update_note_text(&first.id, "one, revised").expect("note exists");

        assert_eq!(updated.id, first.id);
        let notes = doc.notes();
        assert_eq!(notes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), [
            first.id.as_str(),
            second.id.as_str()
        ]);
        assert_eq!(notes[0].text, "one, revised");
        assert_eq!(doc.entry_count(), 2);
    }

    #[test]
    fn update_of_unknown_note_returns_none() {
        let doc = NoteDocument::new("P1");
        doc.create_note("one", "Dana", 5);
        assert!(doc.update_note_text("missing", "x").is_none());
    }

    #[test]
    fn remove_note_drops_all_entries_with_that_id() {
        let doc = NoteDocument::new("P1");
        let note = doc.create_note("dup", "Dana", 5);
        doc.insert_note(&note);
        let keep = doc.create_note("keep", "Dana", 5);

        assert_eq!(doc.remove_note(&note.id), 2);
        assert_eq!(doc.notes(), vec![keep]);
        assert_eq!(doc.remove_note(&note.id), 0);
    }

    #[test]
    fn duplicate_ids_collapse_to_last_content() {
        let doc = NoteDocument::new("P1");
        let mut note = doc.create_note("first", "Dana", 5);
        doc.create_note("other", "Dana", 5);
        note.text = "second".into();
        doc.insert_note(&note);

        let notes = doc.notes();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].id, note.id);
        assert_eq!(notes[0].text, "second");
    }

    #[test]
    fn concurrent_creates_converge() {
        let a = NoteDocument::with_client_id("P1", 1);
        let b = NoteDocument::with_client_id("P1", 2);

        a.create_note("from a", "A", 1);
        b.create_note("from b", "B", 2);
        sync(&a, &b);
        sync(&b, &a);

        assert_eq!(a.notes(), b.notes());
        assert_eq!(a.notes().len(), 2);
    }

    #[test]
    fn concurrent_text_edits_pick_the_same_winner() {
        let a = NoteDocument::with_client_id("P1", 1);
        let b = NoteDocument::with_client_id("P1", 2);
        let note = a.create_note("base", "A", 1);
        sync(&a, &b);

        a.update_note_text(&note.id, "edit from a");
        b.update_note_text(&note.id, "edit from b");
        sync(&a, &b);
        sync(&b, &a);

        let notes_a = a.notes();
        assert_eq!(notes_a, b.notes());
        assert_eq!(notes_a.len(), 1);
        assert!(notes_a[0].text == "edit from a" || notes_a[0].text == "edit from b");
    }

    #[test]
    fn invalid_update_leaves_document_unchanged() {
        let doc = NoteDocument::new("P1");
        doc.create_note("kept", "Dana", 5);
        let before = doc.encode_state();

        assert!(doc.apply_update(b"not a valid update").is_err());
        assert_eq!(doc.encode_state(), before);
    }

    #[test]
    fn invalid_state_vector_is_rejected() {
        let doc = NoteDocument::new("P1");
        assert!(matches!(
            doc.encode_diff(&[0xff, 0xff, 0xff]),
            Err(CrdtError::InvalidStateVector(_))
        ));
    }

    #[test]
    fn entries_without_id_keep_the_same_id_across_reads_and_replicas() {
        let client = NoteDocument::with_client_id("P1", 7);
        push_raw(&client, text_only("no id here"));
        push_raw(&client, text_only("no id either"));

        let first = client.notes();
        let second = client.notes();
        assert_eq!(first.len(), 2);
        assert_eq!(
            first.iter().map(|n| &n.id).collect::<Vec<_>>(),
            second.iter().map(|n| &n.id).collect::<Vec<_>>()
        );
        assert_ne!(first[0].id, first[1].id);

        let replica = NoteDocument::with_client_id("P1", 8);
        replica.apply_update(&client.encode_state()).expect("state should apply");
        let replica_ids: Vec<_> = replica.notes().into_iter().map(|n| n.id).collect();
        assert_eq!(replica_ids, first.iter().map(|n| n.id.clone()).collect::<Vec<_>>());
    }

    #[test]
    fn entries_without_id_can_be_updated_and_removed_by_their_id() {
        let doc = NoteDocument::with_client_id("P1", 7);
        doc.create_note("keep", "Dana", 5);
        push_raw(&doc, text_only("orphan"));
        let orphan_id = doc.notes()[1].id.clone();

        let updated = doc.update_note_text(&orphan_id, "orphan, revised").expect("entry exists");
        assert_eq!(updated.id, orphan_id);
        assert_eq!(doc.notes()[1].id, orphan_id);

        assert_eq!(doc.remove_note(&orphan_id), 1);
        assert_eq!(doc.notes().len(), 1);
    }

    #[test]
    fn repair_entries_writes_fallbacks_back_once() {
        let doc = NoteDocument::with_client_id("P1", 7);
        let clean = doc.create_note("clean", "Dana", 5);
        push_raw(&doc, text_only("partial"));
        push_raw(&doc, Any::Bool(true));
        let before = doc.notes();

        let repairs = doc.repair_entries();

        assert_eq!(repairs.iter().map(|r| r.index).collect::<Vec<_>>(), [1, 2]);
        assert!(repairs[0].fields.contains(&RepairedField::Id));
        assert_eq!(repairs[1].fields, vec![RepairedField::Shape]);
        assert!(doc.repair_entries().is_empty());
        assert!(doc.materialize().repairs.is_empty());

        let after = doc.notes();
        assert_eq!(after.len(), 3);
        assert_eq!(after[0], clean);
        assert_eq!(
            after.iter().map(|n| &n.id).collect::<Vec<_>>(),
            before.iter().map(|n| &n.id).collect::<Vec<_>>()
        );
        assert_eq!(after[1].text, "partial");
        assert_eq!(after, doc.notes());
    }
}
