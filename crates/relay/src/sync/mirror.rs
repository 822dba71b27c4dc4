// Relational mirror of materialized notes.
//
// One row per note id, scoped by parcel. Postgres in production; an in-memory
// map when no database is configured and in tests, where individual writes
// can be made to fail.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldnotes_common::types::FieldNote;
use sqlx::PgPool;
use tokio::sync::RwLock;

use super::reconcile::ReconcilePlan;

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct NoteRow {
    pub id: String,
    pub parcel_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub user_id: i64,
}

impl From<&FieldNote> for NoteRow {
    fn from(note: &FieldNote) -> Self {
        Self {
            id: note.id.clone(),
            parcel_id: note.parcel_id.clone(),
            text: note.text.clone(),
            created_at: note.created_at,
            created_by: note.created_by.clone(),
            user_id: note.user_id,
        }
    }
}

impl From<NoteRow> for FieldNote {
    fn from(row: NoteRow) -> Self {
        Self {
            id: row.id,
            parcel_id: row.parcel_id,
            text: row.text,
            created_at: row.created_at,
            created_by: row.created_by,
            user_id: row.user_id,
        }
    }
}

#[derive(Debug)]
pub enum MirrorError {
    Query { operation: &'static str, source: sqlx::Error },

    Unavailable { operation: &'static str },

    RejectedWrite { operation: &'static str, note_id: String },
}

impl std::fmt::Display for MirrorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query { operation, source } => {
                write!(f, "field note mirror {operation} failed: {source}")
            }
            Self::Unavailable { operation } => {
                write!(f, "field note mirror is unavailable for {operation}")
            }
            Self::RejectedWrite { operation, note_id } => {
                write!(f, "field note mirror rejected {operation} of note {note_id}")
            }
        }
    }
}

impl std::error::Error for MirrorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Query { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub enum NoteMirror {
    Postgres(PgPool),
    Memory(Arc<RwLock<MemoryMirror>>),
}

#[derive(Default)]
pub struct MemoryMirror {
    rows: HashMap<String, NoteRow>,
    rejected_ids: HashSet<String>,
    unavailable: bool,
    latency: Option<Duration>,
}

impl MemoryMirror {
    /// Make every write touching `note_id` fail.
    pub fn reject_writes_for(&mut self, note_id: impl Into<String>) {
        self.rejected_ids.insert(note_id.into());
    }

    /// Make every operation fail, as a lost database connection would.
    pub fn set_unavailable(&mut self, unavailable: bool) {
        self.unavailable = unavailable;
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&mut self, latency: Option<Duration>) {
        self.latency = latency;
    }

    fn check(&self, operation: &'static str, note_id: Option<&str>) -> Result<(), MirrorError> {
        if self.unavailable {
            return Err(MirrorError::Unavailable { operation });
        }
        match note_id {
            Some(id) if self.rejected_ids.contains(id) => {
                Err(MirrorError::RejectedWrite { operation, note_id: id.to_owned() })
            }
            _ => Ok(()),
        }
    }
}

impl NoteMirror {
    pub fn memory() -> Self {
        Self::Memory(Arc::new(RwLock::new(MemoryMirror::default())))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Memory(_) => "memory",
        }
    }

    pub async fn select_by_parcel(&self, parcel_id: &str) -> Result<Vec<NoteRow>, MirrorError> {
        match self {
            Self::Postgres(pool) => select_by_parcel_pg(pool, parcel_id).await,
            Self::Memory(store) => select_by_parcel_mem(store, parcel_id).await,
        }
    }

    pub async fn insert(&self, note: &FieldNote) -> Result<(), MirrorError> {
        match self {
            Self::Postgres(pool) => insert_pg(pool, note).await,
            Self::Memory(store) => insert_mem(store, note).await,
        }
    }

    /// Returns whether a row was updated.
    pub async fn update_text(
        &self,
        parcel_id: &str,
        note_id: &str,
        text: &str,
    ) -> Result<bool, MirrorError> {
        match self {
            Self::Postgres(pool) => update_text_pg(pool, parcel_id, note_id, text).await,
            Self::Memory(store) => update_text_mem(store, parcel_id, note_id, text).await,
        }
    }

    /// Returns whether a row existed.
    pub async fn delete(&self, parcel_id: &str, note_id: &str) -> Result<bool, MirrorError> {
        match self {
            Self::Postgres(pool) => delete_pg(pool, parcel_id, note_id).await,
            Self::Memory(store) => delete_mem(store, parcel_id, note_id).await,
        }
    }

    /// Apply a whole plan or none of it.
    pub async fn apply_plan_atomically(
        &self,
        parcel_id: &str,
        plan: &ReconcilePlan,
    ) -> Result<(), MirrorError> {
        match self {
            Self::Postgres(pool) => apply_plan_pg(pool, parcel_id, plan).await,
            Self::Memory(store) => apply_plan_mem(store, parcel_id, plan).await,
        }
    }
}

// ── Postgres ───────────────────────────────────────────────────────

async fn select_by_parcel_pg(pool: &PgPool, parcel_id: &str) -> Result<Vec<NoteRow>, MirrorError> {
    sqlx::query_as::<_, NoteRow>(
        r#"
        SELECT id, parcel_id, text, created_at, created_by, user_id
        FROM field_notes
        WHERE parcel_id = $1
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(parcel_id)
    .fetch_all(pool)
    .await
    .map_err(|source| MirrorError::Query { operation: "select", source })
}

async fn insert_pg<'e, E>(executor: E, note: &FieldNote) -> Result<(), MirrorError>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO field_notes (id, parcel_id, text, created_at, created_by, user_id)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&note.id)
    .bind(&note.parcel_id)
    .bind(&note.text)
    .bind(note.created_at)
    .bind(&note.created_by)
    .bind(note.user_id)
    .execute(executor)
    .await
    .map(|_| ())
    .map_err(|source| MirrorError::Query { operation: "insert", source })
}

async fn update_text_pg<'e, E>(
    executor: E,
    parcel_id: &str,
    note_id: &str,
    text: &str,
) -> Result<bool, MirrorError>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE field_notes
        SET text = $3, updated_at = now()
        WHERE parcel_id = $1 AND id = $2
        "#,
    )
    .bind(parcel_id)
    .bind(note_id)
    .bind(text)
    .execute(executor)
    .await
    .map_err(|source| MirrorError::Query { operation: "update", source })?;

    Ok(result.rows_affected() > 0)
}

async fn delete_pg<'e, E>(executor: E, parcel_id: &str, note_id: &str) -> Result<bool, MirrorError>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM field_notes WHERE parcel_id = $1 AND id = $2")
        .bind(parcel_id)
        .bind(note_id)
        .execute(executor)
        .await
        .map_err(|source| MirrorError::Query { operation: "delete", source })?;

    Ok(result.rows_affected() > 0)
}

async fn apply_plan_pg(
    pool: &PgPool,
    parcel_id: &str,
    plan: &ReconcilePlan,
) -> Result<(), MirrorError> {
    let mut tx =
        pool.begin().await.map_err(|source| MirrorError::Query { operation: "begin", source })?;

    for note in &plan.inserts {
        insert_pg(&mut *tx, note).await?;
    }
    for (note_id, text) in &plan.updates {
        update_text_pg(&mut *tx, parcel_id, note_id, text).await?;
    }
    for note_id in &plan.deletes {
        delete_pg(&mut *tx, parcel_id, note_id).await?;
    }

    tx.commit().await.map_err(|source| MirrorError::Query { operation: "commit", source })
}

// ── Memory ─────────────────────────────────────────────────────────

async fn simulate_latency(store: &RwLock<MemoryMirror>) {
    let latency = store.read().await.latency;
    if let Some(latency) = latency {
        tokio::time::sleep(latency).await;
    }
}

async fn select_by_parcel_mem(
    store: &RwLock<MemoryMirror>,
    parcel_id: &str,
) -> Result<Vec<NoteRow>, MirrorError> {
    simulate_latency(store).await;
    let store = store.read().await;
    store.check("select", None)?;

    let mut rows: Vec<NoteRow> =
        store.rows.values().filter(|row| row.parcel_id == parcel_id).cloned().collect();
    rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(rows)
}

async fn insert_mem(store: &RwLock<MemoryMirror>, note: &FieldNote) -> Result<(), MirrorError> {
    simulate_latency(store).await;
    let mut store = store.write().await;
    store.check("insert", Some(&note.id))?;
    if store.rows.contains_key(&note.id) {
        return Err(MirrorError::RejectedWrite { operation: "insert", note_id: note.id.clone() });
    }
    store.rows.insert(note.id.clone(), NoteRow::from(note));
    Ok(())
}

async fn update_text_mem(
    store: &RwLock<MemoryMirror>,
    parcel_id: &str,
    note_id: &str,
    text: &str,
) -> Result<bool, MirrorError> {
    simulate_latency(store).await;
    let mut store = store.write().await;
    store.check("update", Some(note_id))?;
    match store.rows.get_mut(note_id).filter(|row| row.parcel_id == parcel_id) {
        Some(row) => {
            row.text = text.to_owned();
            Ok(true)
        }
        None => Ok(false),
    }
}

async fn delete_mem(
    store: &RwLock<MemoryMirror>,
    parcel_id: &str,
    note_id: &str,
) -> Result<bool, MirrorError> {
    simulate_latency(store).await;
    let mut store = store.write().await;
    store.check("delete", Some(note_id))?;
    let owned = store.rows.get(note_id).is_some_and(|row| row.parcel_id == parcel_id);
    if owned {
        store.rows.remove(note_id);
    }
    Ok(owned)
}

async fn apply_plan_mem(
    store: &RwLock<MemoryMirror>,
    parcel_id: &str,
    plan: &ReconcilePlan,
) -> Result<(), MirrorError> {
    simulate_latency(store).await;
    let mut store = store.write().await;

    // Validate everything first so a rejected write leaves the map untouched.
    for note in &plan.inserts {
        store.check("insert", Some(&note.id))?;
        if store.rows.contains_key(&note.id) {
            return Err(MirrorError::RejectedWrite { operation: "insert", note_id: note.id.clone() });
        }
    }
    for (note_id, _) in &plan.updates {
        store.check("update", Some(note_id))?;
    }
    for note_id in &plan.deletes {
        store.check("delete", Some(note_id))?;
    }

    for note in &plan.inserts {
        store.rows.insert(note.id.clone(), NoteRow::from(note));
    }
    for (note_id, text) in &plan.updates {
        if let Some(row) = store.rows.get_mut(note_id).filter(|row| row.parcel_id == parcel_id) {
            row.text = text.clone();
        }
    }
    for note_id in &plan.deletes {
        if store.rows.get(note_id).is_some_and(|row| row.parcel_id == parcel_id) {
            store.rows.remove(note_id);
        }
    }

    Ok(())
}
