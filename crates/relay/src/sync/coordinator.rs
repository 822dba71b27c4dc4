// Request-level orchestration for parcel notes.
//
// Each mutating call runs decode -> merge -> persist -> respond while holding
// the parcel's document lock, so merges and mirror reconciles of one parcel
// never interleave.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fieldnotes_common::crdt::codec;
use fieldnotes_common::crdt::note_doc::NoteDocument;
use fieldnotes_common::crdt::validate::NoteRepair;
use fieldnotes_common::crdt::CrdtError;
use fieldnotes_common::types::FieldNote;

use super::doc_store::{DocStoreError, DocumentStore, ParcelDoc};
use super::mirror::{MirrorError, NoteMirror};
use super::reconcile::{reconcile, ReconcileMode, ReconcileReport};
use crate::metrics;

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub persist_timeout: Duration,
    pub strict_reconcile: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { persist_timeout: Duration::from_secs(5), strict_reconcile: false }
    }
}

#[derive(Debug)]
pub enum SyncError {
    MissingInput { field: &'static str },

    InvalidUpdate { parcel_id: String, source: CrdtError },

    NoteNotFound { parcel_id: String, note_id: String },

    Storage(DocStoreError),

    /// The merge succeeded but the mirror could not be brought in line.
    Persistence { parcel_id: String, report: ReconcileReport },

    DeleteFailed { parcel_id: String, note_id: String, source: Option<MirrorError> },
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingInput { field } => write!(f, "{field} is required"),
            Self::InvalidUpdate { parcel_id, source } => {
                write!(f, "rejected update for parcel {parcel_id}: {source}")
            }
            Self::NoteNotFound { parcel_id, note_id } => {
                write!(f, "note {note_id} not found in parcel {parcel_id}")
            }
            Self::Storage(error) => write!(f, "{error}"),
            Self::Persistence { parcel_id, report } => write!(
                f,
                "persisting notes for parcel {parcel_id} failed ({} failed writes, timed_out={})",
                report.failed, report.timed_out
            ),
            Self::DeleteFailed { parcel_id, note_id, source: Some(source) } => {
                write!(f, "deleting note {note_id} of parcel {parcel_id} failed: {source}")
            }
            Self::DeleteFailed { parcel_id, note_id, source: None } => {
                write!(f, "deleting note {note_id} of parcel {parcel_id} timed out")
            }
        }
    }
}

impl std::error::Error for SyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidUpdate { source, .. } => Some(source),
            Self::Storage(source) => Some(source),
            Self::DeleteFailed { source: Some(source), .. } => Some(source),
            _ => None,
        }
    }
}

impl From<DocStoreError> for SyncError {
    fn from(error: DocStoreError) -> Self {
        Self::Storage(error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Full post-merge document state as transport text.
    pub state: String,
    pub notes: Vec<FieldNote>,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    store: Arc<DocumentStore>,
    mirror: NoteMirror,
    config: CoordinatorConfig,
}

impl SyncCoordinator {
    pub fn new(store: Arc<DocumentStore>, mirror: NoteMirror, config: CoordinatorConfig) -> Self {
        Self { store, mirror, config }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Materialized notes of a parcel. Never mutates the document.
    pub async fn read_notes(&self, parcel_id: &str) -> Result<Vec<FieldNote>, SyncError> {
        let parcel_id = require("parcelId", parcel_id)?;
        let doc = self.store.get_or_create(parcel_id).await?;
        let document = doc.lock().await;
        Ok(materialize(&document))
    }

    /// One-way apply: merge the client's update and return the notes.
    pub async fn apply_update(
        &self,
        parcel_id: &str,
        update: Option<&str>,
    ) -> Result<Vec<FieldNote>, SyncError> {
        let (doc, payload) = self.prepare(parcel_id, update).await?;
        let document = doc.lock().await;
        let notes = self.merge_and_persist(&doc, &document, &payload).await?;
        Ok(notes)
    }

    /// Two-way sync: merge the client's update and return the full state
    /// along with the notes.
    pub async fn sync(&self, parcel_id: &str, update: Option<&str>) -> Result<SyncOutcome, SyncError> {
        let (doc, payload) = self.prepare(parcel_id, update).await?;
        let document = doc.lock().await;
        let notes = self.merge_and_persist(&doc, &document, &payload).await?;
        let state = codec::encode(&document);
        Ok(SyncOutcome { state, notes })
    }

    /// Remove a note from the document and its row from the mirror.
    pub async fn delete_note(&self, parcel_id: &str, note_id: &str) -> Result<(), SyncError> {
        let parcel_id = require("parcelId", parcel_id)?;
        let note_id = require("noteId", note_id)?;

        let doc = self.store.get_or_create(parcel_id).await?;
        let document = doc.lock().await;
        if !document.contains_note(note_id) {
            return Err(SyncError::NoteNotFound {
                parcel_id: parcel_id.to_owned(),
                note_id: note_id.to_owned(),
            });
        }

        let removed = document.remove_note(note_id);
        tracing::info!(parcel_id, note_id, entries = removed, "removed note from document");

        let outcome =
            tokio::time::timeout(self.config.persist_timeout, self.mirror.delete(parcel_id, note_id))
                .await;
        let failure = match outcome {
            Ok(Ok(existed)) => {
                if !existed {
                    tracing::debug!(parcel_id, note_id, "deleted note had no mirror row");
                }
                None
            }
            Ok(Err(error)) => Some(Some(error)),
            Err(_) => Some(None),
        };

        if let Some(source) = failure {
            let timed_out = source.is_none();
            metrics::record_reconcile(1, timed_out);
            tracing::error!(
                parcel_id,
                note_id,
                timed_out,
                error = ?source,
                "failed to delete note row"
            );
            if self.config.strict_reconcile {
                return Err(SyncError::DeleteFailed {
                    parcel_id: parcel_id.to_owned(),
                    note_id: note_id.to_owned(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Validate input and decode the transport text before touching any
    /// document.
    async fn prepare(
        &self,
        parcel_id: &str,
        update: Option<&str>,
    ) -> Result<(Arc<ParcelDoc>, Vec<u8>), SyncError> {
        let parcel_id = require("parcelId", parcel_id)?;
        let update = require("update", update.unwrap_or_default())?;

        let payload = codec::decode(update).map_err(|source| {
            tracing::warn!(parcel_id, error = %source, "rejected undecodable update text");
            SyncError::InvalidUpdate { parcel_id: parcel_id.to_owned(), source }
        })?;

        let doc = self.store.get_or_create(parcel_id).await?;
        Ok((doc, payload))
    }

    async fn merge_and_persist(
        &self,
        doc: &ParcelDoc,
        document: &NoteDocument,
        payload: &[u8],
    ) -> Result<Vec<FieldNote>, SyncError> {
        let parcel_id = doc.parcel_id();
        let started = Instant::now();

        document.apply_update(payload).map_err(|source| {
            tracing::warn!(parcel_id, bytes = payload.len(), error = %source, "rejected update");
            SyncError::InvalidUpdate { parcel_id: parcel_id.to_owned(), source }
        })?;

        // Fix malformed entries in the document itself, so their fallback
        // values reach the mirror and the clients unchanged from now on.
        record_repairs(parcel_id, &document.repair_entries());
        let notes = materialize(document);
        tracing::debug!(
            parcel_id,
            bytes = payload.len(),
            notes = notes.len(),
            merge_ms = started.elapsed().as_millis() as u64,
            "merged update"
        );

        let mode = if self.config.strict_reconcile {
            ReconcileMode::Atomic
        } else {
            ReconcileMode::PerNote
        };
        let report =
            reconcile(&self.mirror, parcel_id, &notes, mode, self.config.persist_timeout).await;

        if self.config.strict_reconcile && !report.is_clean() {
            return Err(SyncError::Persistence { parcel_id: parcel_id.to_owned(), report });
        }
        Ok(notes)
    }
}

fn require<'a>(field: &'static str, value: &'a str) -> Result<&'a str, SyncError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SyncError::MissingInput { field });
    }
    Ok(trimmed)
}

/// Materialize the note list, logging and counting every validator repair.
fn materialize(document: &NoteDocument) -> Vec<FieldNote> {
    let materialized = document.materialize();
    record_repairs(document.parcel_id(), &materialized.repairs);
    materialized.notes
}

fn record_repairs(parcel_id: &str, repairs: &[NoteRepair]) {
    for repair in repairs {
        let fields: Vec<&str> = repair.fields.iter().map(|field| field.as_str()).collect();
        tracing::warn!(
            parcel_id,
            index = repair.index,
            note_id = %repair.note_id,
            fields = ?fields,
            "repaired malformed note record"
        );
        for field in &repair.fields {
            metrics::record_note_repair(field.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use fieldnotes_common::crdt::note_doc::NOTES_ARRAY;
    use yrs::{Any, Array, Doc, ReadTxn, StateVector, Transact};

    use super::*;
    use crate::sync::doc_store::DocStoreConfig;

    fn coordinator_with(mirror: NoteMirror, strict_reconcile: bool) -> SyncCoordinator {
        let store = Arc::new(DocumentStore::new(mirror.clone(), DocStoreConfig::default()));
        SyncCoordinator::new(
            store,
            mirror,
            CoordinatorConfig { persist_timeout: Duration::from_secs(1), strict_reconcile },
        )
    }

    /// Update produced by a fresh client that creates one note.
    fn create_note_update(parcel_id: &str, text: &str, client_id: u64) -> (FieldNote, String) {
        let client = NoteDocument::with_client_id(parcel_id, client_id);
        codec::capture(&client, |doc| doc.create_note(text, "Field Tech", 11))
    }

    /// Update from a plain Yjs client that pushed a record with no id.
    fn id_less_update(text: &str, client_id: u64) -> String {
        let doc = Doc::with_client_id(client_id);
        let notes = doc.get_or_insert_array(NOTES_ARRAY);
        let record = HashMap::from([("text".to_owned(), Any::String(Arc::from(text)))]);
        notes.push_back(&mut doc.transact_mut(), Any::Map(Arc::new(record)));
        let state = doc.transact().encode_state_as_update_v1(&StateVector::default());
        codec::encode_bytes(&state)
    }

    #[tokio::test]
    async fn read_of_unseen_parcel_is_empty() {
        let coordinator = coordinator_with(NoteMirror::memory(), false);
        assert!(coordinator.read_notes("P-404").await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn apply_update_merges_and_mirrors_the_note() {
        let mirror = NoteMirror::memory();
        let coordinator = coordinator_with(mirror.clone(), false);
        let (created, update) = create_note_update("P1", "shed needs paint", 21);

        let notes = coordinator.apply_update("P1", Some(&update)).await.expect("apply");

        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, created.id);
        let rows = mirror.select_by_parcel("P1").await.expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].text, "shed needs paint");
    }

    #[tokio::test]
    async fn sync_returns_state_that_rebuilds_the_same_notes() {
        let coordinator = coordinator_with(NoteMirror::memory(), false);
        let (_, first) = create_note_update("P1", "from a", 31);
        let (_, second) = create_note_update("P1", "from b", 32);
        coordinator.apply_update("P1", Some(&first)).await.expect("first");

        let outcome = coordinator.sync("P1", Some(&second)).await.expect("sync");

        assert_eq!(outcome.notes.len(), 2);
        let replica = NoteDocument::new("P1");
        codec::apply(&replica, &outcome.state).expect("state should apply");
        assert_eq!(replica.notes(), outcome.notes);
    }

    #[tokio::test]
    async fn blank_inputs_are_rejected_before_any_work() {
        let coordinator = coordinator_with(NoteMirror::memory(), false);

        assert!(matches!(
            coordinator.apply_update("  ", Some("AAA=")).await,
            Err(SyncError::MissingInput { field: "parcelId" })
        ));
        assert!(matches!(
            coordinator.sync("P1", None).await,
            Err(SyncError::MissingInput { field: "update" })
        ));
        assert!(matches!(
            coordinator.delete_note("P1", "").await,
            Err(SyncError::MissingInput { field: "noteId" })
        ));
        assert!(!coordinator.store().contains("P1").await);
    }

    #[tokio::test]
    async fn invalid_update_leaves_notes_unchanged() {
        let coordinator = coordinator_with(NoteMirror::memory(), false);
        let (_, update) = create_note_update("P1", "kept", 41);
        coordinator.apply_update("P1", Some(&update)).await.expect("seed");

        let not_base64 = coordinator.apply_update("P1", Some("%%%")).await;
        let not_an_update = coordinator.apply_update("P1", Some("bm90IGFuIHVwZGF0ZQ==")).await;

        assert!(matches!(not_base64, Err(SyncError::InvalidUpdate { .. })));
        assert!(matches!(not_an_update, Err(SyncError::InvalidUpdate { .. })));
        assert_eq!(coordinator.read_notes("P1").await.expect("read").len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_note_and_row() {
        let mirror = NoteMirror::memory();
        let coordinator = coordinator_with(mirror.clone(), false);
        let (created, update) = create_note_update("P1", "remove me", 51);
        coordinator.apply_update("P1", Some(&update)).await.expect("seed");

        coordinator.delete_note("P1", &created.id).await.expect("delete");

        assert!(coordinator.read_notes("P1").await.expect("read").is_empty());
        assert!(mirror.select_by_parcel("P1").await.expect("select").is_empty());
    }

    #[tokio::test]
    async fn delete_of_unknown_note_changes_nothing() {
        let coordinator = coordinator_with(NoteMirror::memory(), false);
        let (_, update) = create_note_update("P1", "stays", 61);
        coordinator.apply_update("P1", Some(&update)).await.expect("seed");

        let result = coordinator.delete_note("P1", "no-such-note").await;

        assert!(matches!(result, Err(SyncError::NoteNotFound { .. })));
        assert_eq!(coordinator.read_notes("P1").await.expect("read").len(), 1);
    }

    #[tokio::test]
    async fn persistence_failures_are_tolerated_unless_strict() {
        let (created, update) = create_note_update("P1", "unlucky", 71);

        for strict in [false, true] {
            let mirror = NoteMirror::memory();
            if let NoteMirror::Memory(inner) = &mirror {
                inner.write().await.reject_writes_for(created.id.clone());
            }
            let coordinator = coordinator_with(mirror, strict);

            let result = coordinator.apply_update("P1", Some(&update)).await;
            if strict {
                assert!(matches!(result, Err(SyncError::Persistence { .. })));
            } else {
                assert_eq!(result.expect("lenient apply").len(), 1);
            }
            // The merge itself is kept either way.
            assert_eq!(coordinator.read_notes("P1").await.expect("read").len(), 1);
        }
    }

    #[tokio::test]
    async fn hydration_failure_surfaces_as_storage_error() {
        let mirror = NoteMirror::memory();
        if let NoteMirror::Memory(inner) = &mirror {
            inner.write().await.set_unavailable(true);
        }
        let coordinator = coordinator_with(mirror, false);

        assert!(matches!(coordinator.read_notes("P1").await, Err(SyncError::Storage(_))));
    }

    #[tokio::test]
    async fn concurrent_applies_on_one_parcel_all_reach_the_mirror() {
        let mirror = NoteMirror::memory();
        let coordinator = coordinator_with(mirror.clone(), false);

        let mut tasks = Vec::new();
        for client_id in 100..110 {
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(async move {
                let (_, update) = create_note_update("P1", "parallel", client_id);
                coordinator.apply_update("P1", Some(&update)).await.map(|notes| notes.len())
            }));
        }
        for task in tasks {
            task.await.expect("task").expect("apply");
        }

        assert_eq!(coordinator.read_notes("P1").await.expect("read").len(), 10);
        assert_eq!(mirror.select_by_parcel("P1").await.expect("select").len(), 10);
    }

    #[tokio::test]
    async fn note_without_id_keeps_one_id_through_reads_applies_and_delete() {
        let mirror = NoteMirror::memory();
        let coordinator = coordinator_with(mirror.clone(), false);

        let applied = coordinator
            .apply_update("P1", Some(&id_less_update("no id here", 81)))
            .await
            .expect("apply");
        let first = coordinator.read_notes("P1").await.expect("first read");
        let second = coordinator.read_notes("P1").await.expect("second read");

        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].text, "no id here");
        assert_eq!(first, applied);
        assert_eq!(second, first);

        let note_id = first[0].id.clone();
        let empty = codec::encode(&NoteDocument::new("P1"));
        coordinator.apply_update("P1", Some(&empty)).await.expect("no-op apply");
        let rows = mirror.select_by_parcel("P1").await.expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, note_id);

        coordinator.delete_note("P1", &note_id).await.expect("delete by the id a read returned");
        assert!(coordinator.read_notes("P1").await.expect("read").is_empty());
        assert!(mirror.select_by_parcel("P1").await.expect("select").is_empty());
    }

    #[tokio::test]
    async fn repaired_records_are_shipped_back_to_clients() {
        let coordinator = coordinator_with(NoteMirror::memory(), false);

        let outcome =
            coordinator.sync("P1", Some(&id_less_update("orphan", 82))).await.expect("sync");

        let replica = NoteDocument::new("P1");
        codec::apply(&replica, &outcome.state).expect("state should apply");
        let materialized = replica.materialize();
        assert!(materialized.repairs.is_empty(), "unexpected repairs: {:?}", materialized.repairs);
        assert_eq!(materialized.notes, outcome.notes);
    }
}
