// Parcel note endpoints.
//
// Routes:
//   GET    /v1/parcels/{parcel_id}/notes            materialized notes
//   PUT    /v1/parcels/{parcel_id}/notes            one-way apply
//   POST   /v1/parcels/{parcel_id}/sync             two-way sync
//   DELETE /v1/parcels/{parcel_id}/notes/{note_id}  remove one note

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use fieldnotes_common::protocol::http::{NotesEnvelope, SyncResponse, UpdateRequest};
use serde_json::json;

use crate::{
    error::{ErrorCode, RelayError},
    sync::coordinator::{SyncCoordinator, SyncError},
    validation::ValidatedJson,
};

#[derive(Clone)]
struct NotesApiState {
    coordinator: SyncCoordinator,
}

// ── Error ──────────────────────────────────────────────────────────

#[derive(Debug)]
struct NotesApiError(SyncError);

impl From<SyncError> for NotesApiError {
    fn from(error: SyncError) -> Self {
        Self(error)
    }
}

impl IntoResponse for NotesApiError {
    fn into_response(self) -> Response {
        let error = self.0;
        match &error {
            SyncError::MissingInput { field } => {
                RelayError::new(ErrorCode::ValidationFailed, error.to_string())
                    .with_details(json!({ "field": field }))
                    .into_response()
            }
            SyncError::InvalidUpdate { source, .. } => {
                RelayError::new(ErrorCode::InvalidUpdate, source.to_string()).into_response()
            }
            SyncError::NoteNotFound { note_id, .. } => {
                RelayError::new(ErrorCode::NotFound, "note not found")
                    .with_details(json!({ "note_id": note_id }))
                    .into_response()
            }
            SyncError::Storage(_) => {
                tracing::error!(error = %error, "note storage unavailable");
                RelayError::from_code(ErrorCode::StorageUnavailable).into_response()
            }
            SyncError::Persistence { report, .. } => {
                tracing::error!(error = %error, "strict reconcile failed");
                RelayError::from_code(ErrorCode::PersistenceFailed)
                    .with_details(json!({
                        "inserted": report.inserted,
                        "updated": report.updated,
                        "deleted": report.deleted,
                        "failed": report.failed,
                        "timed_out": report.timed_out,
                    }))
                    .into_response()
            }
            SyncError::DeleteFailed { .. } => {
                tracing::error!(error = %error, "strict note delete failed");
                RelayError::from_code(ErrorCode::PersistenceFailed).into_response()
            }
        }
    }
}

// ── Router ─────────────────────────────────────────────────────────

pub fn router(coordinator: SyncCoordinator) -> Router {
    let state = NotesApiState { coordinator };

    Router::new()
        .route("/v1/parcels/{parcel_id}/notes", get(list_notes).put(apply_notes_update))
        .route("/v1/parcels/{parcel_id}/sync", post(sync_notes))
        .route("/v1/parcels/{parcel_id}/notes/{note_id}", delete(delete_note))
        .with_state(state)
}

// ── Handlers ───────────────────────────────────────────────────────

async fn list_notes(
    State(state): State<NotesApiState>,
    Path(parcel_id): Path<String>,
) -> Result<Json<NotesEnvelope>, NotesApiError> {
    let notes = state.coordinator.read_notes(&parcel_id).await?;
    Ok(Json(NotesEnvelope { notes }))
}

async fn apply_notes_update(
    State(state): State<NotesApiState>,
    Path(parcel_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<UpdateRequest>,
) -> Result<Json<NotesEnvelope>, NotesApiError> {
    let notes = state.coordinator.apply_update(&parcel_id, payload.update.as_deref()).await?;
    Ok(Json(NotesEnvelope { notes }))
}

async fn sync_notes(
    State(state): State<NotesApiState>,
    Path(parcel_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<UpdateRequest>,
) -> Result<Json<SyncResponse>, NotesApiError> {
    let outcome = state.coordinator.sync(&parcel_id, payload.update.as_deref()).await?;
    Ok(Json(SyncResponse { state: outcome.state, data: NotesEnvelope { notes: outcome.notes } }))
}

async fn delete_note(
    State(state): State<NotesApiState>,
    Path((parcel_id, note_id)): Path<(String, String)>,
) -> Result<StatusCode, NotesApiError> {
    state.coordinator.delete_note(&parcel_id, &note_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Tests ──────────────────────────────────────────────────────────
