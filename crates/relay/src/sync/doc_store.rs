use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fieldnotes_common::crdt::note_doc::NoteDocument;
use fieldnotes_common::types::FieldNote;
use tokio::sync::{Mutex, MutexGuard, OnceCell, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::mirror::{MirrorError, NoteMirror};
use crate::metrics;

const DEFAULT_MAX_RESIDENT_DOCS: usize = 10_000;
const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(300);
const DEFAULT_HYDRATE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct DocStoreConfig {
    pub max_resident_docs: usize,
    pub idle_ttl: Duration,
    pub hydrate_timeout: Duration,
}

impl Default for DocStoreConfig {
    fn default() -> Self {
        Self {
            max_resident_docs: DEFAULT_MAX_RESIDENT_DOCS,
            idle_ttl: DEFAULT_IDLE_TTL,
            hydrate_timeout: DEFAULT_HYDRATE_TIMEOUT,
        }
    }
}

#[derive(Debug)]
pub enum DocStoreError {
    Hydration { parcel_id: String, source: MirrorError },

    HydrationTimedOut { parcel_id: String, deadline: Duration },
}

impl std::fmt::Display for DocStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hydration { parcel_id, source } => {
                write!(f, "failed to hydrate notes for parcel {parcel_id}: {source}")
            }
            Self::HydrationTimedOut { parcel_id, deadline } => write!(
                f,
                "hydrating notes for parcel {parcel_id} exceeded {}ms",
                deadline.as_millis()
            ),
        }
    }
}

impl std::error::Error for DocStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Hydration { source, .. } => Some(source),
            Self::HydrationTimedOut { .. } => None,
        }
    }
}

/// A resident parcel document. Mutating callers hold [`ParcelDoc::lock`]
/// across merge and reconcile.
pub struct ParcelDoc {
    parcel_id: String,
    document: Mutex<NoteDocument>,
}

impl ParcelDoc {
    pub fn parcel_id(&self) -> &str {
        &self.parcel_id
    }

    pub async fn lock(&self) -> MutexGuard<'_, NoteDocument> {
        self.document.lock().await
    }
}

struct Slot {
    cell: Arc<OnceCell<Arc<ParcelDoc>>>,
    last_touched: Instant,
}

impl Slot {
    /// Nobody is hydrating the slot or holding its document.
    fn is_idle(&self) -> bool {
        Arc::strong_count(&self.cell) == 1
            && self.cell.get().map_or(true, |doc| Arc::strong_count(doc) == 1)
    }
}

pub struct DocumentStore {
    mirror: NoteMirror,
    slots: RwLock<HashMap<String, Slot>>,
    config: DocStoreConfig,
}

impl DocumentStore {
    pub fn new(mirror: NoteMirror, config: DocStoreConfig) -> Self {
        Self { mirror, slots: RwLock::new(HashMap::new()), config }
    }

    /// Resident document for `parcel_id`, hydrating it from the mirror on
    /// first reference. Concurrent first references share one hydration.
    pub async fn get_or_create(&self, parcel_id: &str) -> Result<Arc<ParcelDoc>, DocStoreError> {
        let cell = {
            let mut slots = self.slots.write().await;
            let slot = slots.entry(parcel_id.to_owned()).or_insert_with(|| Slot {
                cell: Arc::new(OnceCell::new()),
                last_touched: Instant::now(),
            });
            slot.last_touched = Instant::now();
            Arc::clone(&slot.cell)
        };

        let doc = cell
            .get_or_try_init(|| async {
                let doc = self.hydrate(parcel_id).await?;
                self.enforce_capacity(parcel_id).await;
                Ok::<_, DocStoreError>(Arc::new(doc))
            })
            .await?;
        Ok(Arc::clone(doc))
    }

    pub async fn contains(&self, parcel_id: &str) -> bool {
        self.slots.read().await.get(parcel_id).is_some_and(|slot| slot.cell.initialized())
    }

    pub async fn resident_count(&self) -> usize {
        self.slots.read().await.values().filter(|slot| slot.cell.initialized()).count()
    }

    /// Unload documents untouched for longer than the idle TTL. Returns the
    /// parcel ids that were unloaded.
    pub async fn unload_idle(&self) -> Vec<String> {
        let now = Instant::now();
        let mut slots = self.slots.write().await;
        let mut unloaded = Vec::new();

        slots.retain(|parcel_id, slot| {
            let expired = now.duration_since(slot.last_touched) >= self.config.idle_ttl;
            if expired && slot.is_idle() {
                if slot.cell.initialized() {
                    unloaded.push(parcel_id.clone());
                }
                false
            } else {
                true
            }
        });

        record_residency(&slots, unloaded.len());
        if !unloaded.is_empty() {
            tracing::debug!(count = unloaded.len(), "unloaded idle parcel documents");
        }
        unloaded
    }

    /// Run [`DocumentStore::unload_idle`] every `interval` until the task is
    /// aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.unload_idle().await;
            }
        })
    }

    async fn hydrate(&self, parcel_id: &str) -> Result<ParcelDoc, DocStoreError> {
        let started = Instant::now();
        let deadline = self.config.hydrate_timeout;

        let rows = tokio::time::timeout(deadline, self.mirror.select_by_parcel(parcel_id))
            .await
            .map_err(|_| DocStoreError::HydrationTimedOut {
                parcel_id: parcel_id.to_owned(),
                deadline,
            })?
            .map_err(|source| DocStoreError::Hydration { parcel_id: parcel_id.to_owned(), source })?;

        let notes: Vec<FieldNote> = rows.into_iter().map(FieldNote::from).collect();
        let document = NoteDocument::new(parcel_id);
        document.insert_notes(&notes);

        metrics::increment_docs_hydrated();
        tracing::debug!(
            parcel_id,
            notes = notes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "hydrated parcel document"
        );

        Ok(ParcelDoc { parcel_id: parcel_id.to_owned(), document: Mutex::new(document) })
    }

    /// Evict least recently touched idle documents until the store is back
    /// under its limit. Documents in use are skipped, so the store may stay
    /// over the limit until they are released.
    async fn enforce_capacity(&self, keep: &str) {
        let mut slots = self.slots.write().await;
        let excess = slots.len().saturating_sub(self.config.max_resident_docs);
        if excess == 0 {
            record_residency(&slots, 0);
            return;
        }

        let mut candidates: Vec<(String, Instant)> = slots
            .iter()
            .filter(|(parcel_id, slot)| parcel_id.as_str() != keep && slot.is_idle())
            .map(|(parcel_id, slot)| (parcel_id.clone(), slot.last_touched))
            .collect();
        candidates.sort_by_key(|(_, last_touched)| *last_touched);

        let mut evicted = 0;
        for (parcel_id, _) in candidates.into_iter().take(excess) {
            slots.remove(&parcel_id);
            evicted += 1;
        }

        if evicted < excess {
            tracing::debug!(
                resident = slots.len(),
                limit = self.config.max_resident_docs,
                "document store over capacity; remaining documents are in use"
            );
        }
        record_residency(&slots, evicted);
    }
}

fn record_residency(slots: &HashMap<String, Slot>, evicted: usize) {
    if evicted > 0 {
        metrics::increment_docs_evicted(evicted as u64);
    }
    metrics::set_resident_docs(slots.len() as u64);
}
