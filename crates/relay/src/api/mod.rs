pub mod notes;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;

use crate::{
    config::RelayConfig,
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    sync::{
        coordinator::{CoordinatorConfig, SyncCoordinator},
        doc_store::{DocStoreConfig, DocumentStore},
        mirror::NoteMirror,
    },
};

/// The notes API plus the document store behind it, which the caller keeps
/// swept.
pub struct NotesService {
    pub router: Router,
    pub store: Arc<DocumentStore>,
}

/// Connect the mirror named by `config` (Postgres when a database URL is set,
/// memory otherwise) and build the notes API on top of it.
pub async fn build_notes_service(config: &RelayConfig) -> Result<NotesService> {
    let mirror = match config.database_url.as_deref() {
        Some(database_url) => {
            let pool = create_pg_pool(database_url, PoolConfig::from_env())
                .await
                .context("failed to initialize field note PostgreSQL pool")?;
            check_pool_health(&pool).await?;
            run_migrations(&pool).await?;
            NoteMirror::Postgres(pool)
        }
        None => {
            tracing::warn!(
                "FIELDNOTES_RELAY_DATABASE_URL is not set; notes are mirrored in memory only"
            );
            NoteMirror::memory()
        }
    };

    Ok(build_notes_service_with_mirror(mirror, config))
}

pub fn build_notes_service_with_mirror(mirror: NoteMirror, config: &RelayConfig) -> NotesService {
    tracing::info!(
        mirror = mirror.kind(),
        max_resident_docs = config.max_resident_docs,
        idle_ttl_secs = config.idle_ttl.as_secs(),
        strict_reconcile = config.strict_reconcile,
        "building notes service"
    );

    let store = Arc::new(DocumentStore::new(
        mirror.clone(),
        DocStoreConfig {
            max_resident_docs: config.max_resident_docs,
            idle_ttl: config.idle_ttl,
            hydrate_timeout: config.persist_timeout,
        },
    ));
    let coordinator = SyncCoordinator::new(
        Arc::clone(&store),
        mirror,
        CoordinatorConfig {
            persist_timeout: config.persist_timeout,
            strict_reconcile: config.strict_reconcile,
        },
    );

    NotesService { router: notes::router(coordinator), store }
}
