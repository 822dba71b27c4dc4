// Persistence bridge: bring the relational mirror in line with a parcel's
// materialized notes.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use fieldnotes_common::types::FieldNote;

use super::mirror::{NoteMirror, NoteRow};
use crate::metrics;

/// Writes needed to make the mirror match a note list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub inserts: Vec<FieldNote>,
    /// `(note_id, new_text)` for rows whose text differs.
    pub updates: Vec<(String, String)>,
    pub deletes: Vec<String>,
}

impl ReconcilePlan {
    pub fn diff(notes: &[FieldNote], rows: &[NoteRow]) -> Self {
        let stored: HashMap<&str, &NoteRow> = rows.iter().map(|row| (row.id.as_str(), row)).collect();
        let live: HashSet<&str> = notes.iter().map(|note| note.id.as_str()).collect();

        let mut plan = Self::default();
        for note in notes {
            match stored.get(note.id.as_str()) {
                Some(row) if row.text != note.text => {
                    plan.updates.push((note.id.clone(), note.text.clone()));
                }
                Some(_) => {}
                None => plan.inserts.push(note.clone()),
            }
        }
        plan.deletes = rows
            .iter()
            .filter(|row| !live.contains(row.id.as_str()))
            .map(|row| row.id.clone())
            .collect();
        plan
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Writes that failed. A failed load of the stored rows counts as one.
    pub failed: usize,
    pub timed_out: bool,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && !self.timed_out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileMode {
    /// Every write stands alone; failures are counted and skipped.
    PerNote,
    /// All writes commit together or not at all.
    Atomic,
}

/// Reconcile the mirror rows of `parcel_id` against `notes`.
///
/// Never returns an error: load and write failures are logged and counted in
/// the report, and a pass that exceeds `deadline` is reported as timed out.
pub async fn reconcile(
    mirror: &NoteMirror,
    parcel_id: &str,
    notes: &[FieldNote],
    mode: ReconcileMode,
    deadline: Duration,
) -> ReconcileReport {
    let started = Instant::now();
    let report = match tokio::time::timeout(deadline, run(mirror, parcel_id, notes, mode)).await {
        Ok(report) => report,
        Err(_) => {
            tracing::warn!(
                parcel_id,
                deadline_ms = deadline.as_millis() as u64,
                "reconcile exceeded persistence deadline"
            );
            ReconcileReport { timed_out: true, ..ReconcileReport::default() }
        }
    };

    metrics::record_reconcile(report.failed as u64, report.timed_out);
    tracing::info!(
        parcel_id,
        inserted = report.inserted,
        updated = report.updated,
        deleted = report.deleted,
        failed = report.failed,
        timed_out = report.timed_out,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "reconciled field note mirror"
    );
    report
}

async fn run(
    mirror: &NoteMirror,
    parcel_id: &str,
    notes: &[FieldNote],
    mode: ReconcileMode,
) -> ReconcileReport {
    let rows = match mirror.select_by_parcel(parcel_id).await {
        Ok(rows) => rows,
        Err(error) => {
            tracing::error!(parcel_id, error = %error, "failed to load mirror rows for reconcile");
            return ReconcileReport { failed: 1, ..ReconcileReport::default() };
        }
    };

    let plan = ReconcilePlan::diff(notes, &rows);
    if plan.is_empty() {
        return ReconcileReport::default();
    }

    match mode {
        ReconcileMode::PerNote => apply_per_note(mirror, parcel_id, &plan).await,
        ReconcileMode::Atomic => match mirror.apply_plan_atomically(parcel_id, &plan).await {
            Ok(()) => ReconcileReport {
                inserted: plan.inserts.len(),
                updated: plan.updates.len(),
                deleted: plan.deletes.len(),
                ..ReconcileReport::default()
            },
            Err(error) => {
                tracing::error!(
                    parcel_id,
                    writes = plan.len(),
                    error = %error,
                    "atomic reconcile rolled back"
                );
                ReconcileReport { failed: plan.len(), ..ReconcileReport::default() }
            }
        },
    }
}

async fn apply_per_note(
    mirror: &NoteMirror,
    parcel_id: &str,
    plan: &ReconcilePlan,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    for (note_id, text) in &plan.updates {
        match mirror.update_text(parcel_id, note_id, text).await {
            Ok(true) => report.updated += 1,
            Ok(false) => {
                tracing::debug!(parcel_id, note_id = %note_id, "mirror row vanished before update");
            }
            Err(error) => {
                report.failed += 1;
                tracing::error!(parcel_id, note_id = %note_id, error = %error, "failed to update note row");
            }
        }
    }

    for note in &plan.inserts {
        match mirror.insert(note).await {
            Ok(()) => report.inserted += 1,
            Err(error) => {
                report.failed += 1;
                tracing::error!(parcel_id, note_id = %note.id, error = %error, "failed to insert note row");
            }
        }
    }

    for note_id in &plan.deletes {
        match mirror.delete(parcel_id, note_id).await {
            Ok(true) => report.deleted += 1,
            Ok(false) => {}
            Err(error) => {
                report.failed += 1;
                tracing::error!(parcel_id, note_id = %note_id, error = %error, "failed to delete note row");
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(text: &str) -> FieldNote {
        FieldNote::new("P1", text, "Dana", 3)
    }

    async fn seed(mirror: &NoteMirror, notes: &[FieldNote]) {
        for note in notes {
            mirror.insert(note).await.expect("seed insert");
        }
    }

    #[test]
    fn plan_only_updates_changed_text() {
        let same = note("same");
        let mut edited = note("before");
        let gone = note("gone");
        let fresh = note("fresh");
        let rows: Vec<NoteRow> = [&same, &edited, &gone].into_iter().map(NoteRow::from).collect();
        edited.text = "after".into();

        let plan = ReconcilePlan::diff(&[same, edited.clone(), fresh.clone()], &rows);

        assert_eq!(plan.inserts, vec![fresh]);
        assert_eq!(plan.updates, vec![(edited.id, "after".to_string())]);
        assert_eq!(plan.deletes, vec![gone.id]);
    }

    #[tokio::test]
    async fn reconcile_inserts_updates_and_deletes() {
        let mirror = NoteMirror::memory();
        let mut kept = note("kept");
        let removed = note("removed");
        seed(&mirror, &[kept.clone(), removed.clone()]).await;

        kept.text = "kept, edited".into();
        let added = note("added");
        let report = reconcile(
            &mirror,
            "P1",
            &[kept.clone(), added.clone()],
            ReconcileMode::PerNote,
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(
            report,
            ReconcileReport { inserted: 1, updated: 1, deleted: 1, failed: 0, timed_out: false }
        );
        let mut rows: Vec<FieldNote> =
            mirror.select_by_parcel("P1").await.expect("select").into_iter().map(Into::into).collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        let mut expected = vec![kept, added];
        expected.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(rows, expected);
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let mirror = NoteMirror::memory();
        let notes = vec![note("one"), note("two")];
        reconcile(&mirror, "P1", &notes, ReconcileMode::PerNote, Duration::from_secs(1)).await;

        let report =
            reconcile(&mirror, "P1", &notes, ReconcileMode::PerNote, Duration::from_secs(1)).await;
        assert_eq!(report, ReconcileReport::default());
    }

    #[tokio::test]
    async fn per_note_failures_do_not_abort_the_batch() {
        let mirror = NoteMirror::memory();
        let bad = note("bad");
        let good = note("good");
        if let NoteMirror::Memory(store) = &mirror {
            store.write().await.reject_writes_for(bad.id.clone());
        }

        let report = reconcile(
            &mirror,
            "P1",
            &[bad, good.clone()],
            ReconcileMode::PerNote,
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(report.inserted, 1);
        assert_eq!(report.failed, 1);
        assert!(!report.is_clean());
        let rows = mirror.select_by_parcel("P1").await.expect("select");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, good.id);
    }

    #[tokio::test]
    async fn atomic_mode_counts_every_write_as_failed_on_rollback() {
        let mirror = NoteMirror::memory();
        let bad = note("bad");
        if let NoteMirror::Memory(store) = &mirror {
            store.write().await.reject_writes_for(bad.id.clone());
        }

        let report = reconcile(
            &mirror,
            "P1",
            &[note("good"), bad],
            ReconcileMode::Atomic,
            Duration::from_secs(1),
        )
        .await;

        assert_eq!(report.failed, 2);
        assert_eq!(report.inserted, 0);
        assert!(mirror.select_by_parcel("P1").await.expect("select").is_empty());
    }

    #[tokio::test]
    async fn load_failure_is_reported_not_raised() {
        let mirror = NoteMirror::memory();
        if let NoteMirror::Memory(store) = &mirror {
            store.write().await.set_unavailable(true);
        }

        let report =
            reconcile(&mirror, "P1", &[note("x")], ReconcileMode::PerNote, Duration::from_secs(1))
                .await;
        assert_eq!(report.failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_mirror_times_out() {
        let mirror = NoteMirror::memory();
        if let NoteMirror::Memory(store) = &mirror {
            store.write().await.set_latency(Some(Duration::from_secs(10)));
        }

        let report = reconcile(
            &mirror,
            "P1",
            &[note("x")],
            ReconcileMode::PerNote,
            Duration::from_millis(100),
        )
        .await;
        assert!(report.timed_out);
        assert!(!report.is_clean());
    }
}
