//! Vector Index
//!
//! A similarity-search store holding `(id, vector, payload)` entries. The
//! [`VectorIndex`] wraps a [`VectorBackend`] and owns every recovery decision:
//! upsert encoding fallbacks, the one-shot collection rebuild on schema drift,
//! and the process-wide "unavailable" latch that turns all later operations
//! into no-ops.

pub mod memory;
pub mod qdrant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{
    Arc, RwLock,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

pub use memory::InMemoryBackend;
pub use qdrant::{QdrantApi, QdrantBackend};

/// Payload attached to every index entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImagePayload {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: ImagePayload,
}

/// A query hit, ordered by descending score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredEntry {
    pub id: u64,
    pub payload: ImagePayload,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
    Cosine,
    Dot,
    Euclid,
}

/// How vectors are laid out in a collection, and how points are encoded on write.
///
/// `Unnamed` is the single anonymous vector (`"vector": [..]`); `Named` wraps it
/// as `"vector": {"<name>": [..]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VectorLayout {
    Unnamed,
    Named(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSpec {
    pub dimension: usize,
    pub distance: Distance,
    pub layout: VectorLayout,
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector store request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("vector store rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("unexpected vector store response: {0}")]
    Decode(String),
}

/// Fragments of store or client complaints that mean "the point encoding does
/// not match the collection's vector configuration".
const SCHEMA_MISMATCH_SIGNATURES: &[&str] = &[
    "not existing vector name",
    "vector name",
    "is not configured",
    "extra inputs are not permitted",
    "field required",
    "expected a map",
    "expected a sequence",
    "invalid type: map",
    "invalid type: sequence",
    "wrong input: vector",
];

impl IndexError {
    /// Classifies a failed write by its failure signature.
    pub fn is_schema_mismatch(&self) -> bool {
        match self {
            IndexError::Rejected { status, body } if (400..500).contains(status) => {
                let body = body.to_lowercase();
                SCHEMA_MISMATCH_SIGNATURES
                    .iter()
                    .any(|signature| body.contains(signature))
            }
            _ => false,
        }
    }
}

/// One implementation per backing-store API version, chosen once at startup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorBackend: Send + Sync {
    /// Short name for logs.
    fn describe(&self) -> String;

    async fn collection_exists(&self, collection: &str) -> Result<bool, IndexError>;

    /// Vector layout of an existing collection; `None` when it is absent.
    async fn collection_layout(
        &self,
        collection: &str,
    ) -> Result<Option<VectorLayout>, IndexError>;

    async fn create_collection(
        &self,
        collection: &str,
        spec: &CollectionSpec,
    ) -> Result<(), IndexError>;

    async fn delete_collection(&self, collection: &str) -> Result<(), IndexError>;

    /// Writes entries, overwriting any existing entry with the same id.
    async fn upsert(
        &self,
        collection: &str,
        entries: &[IndexEntry],
        encoding: &VectorLayout,
    ) -> Result<(), IndexError>;

    /// Number of entries; zero when the collection is absent.
    async fn count(&self, collection: &str) -> Result<u64, IndexError>;

    /// Nearest neighbours by descending similarity; empty when the collection is absent.
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        layout: &VectorLayout,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>, IndexError>;
}

/// Static description of the collection the index manages.
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub collection: String,
    pub dimension: usize,
    pub distance: Distance,
    /// Layout used when the collection has to be created.
    pub layout: VectorLayout,
}

impl IndexSettings {
    pub fn new(collection: impl Into<String>, dimension: usize) -> Self {
        Self {
            collection: collection.into(),
            dimension,
            distance: Distance::Cosine,
            layout: VectorLayout::Named("default".to_string()),
        }
    }
}

/// The resilient front of the similarity-search store.
pub struct VectorIndex {
    backend: Arc<dyn VectorBackend>,
    settings: IndexSettings,
    layout: RwLock<VectorLayout>,
    available: AtomicBool,
    populated: AtomicBool,
    population: OnceCell<usize>,
}

impl VectorIndex {
    pub fn new(backend: Arc<dyn VectorBackend>, settings: IndexSettings) -> Self {
        let layout = RwLock::new(settings.layout.clone());
        Self {
            backend,
            settings,
            layout,
            available: AtomicBool::new(true),
            populated: AtomicBool::new(false),
            population: OnceCell::new(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.settings.collection
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::Acquire)
    }

    /// True when queries may hit the store.
    pub fn is_ready(&self) -> bool {
        self.is_available() && self.is_populated()
    }

    /// Latches the index into degraded mode for the rest of the process.
    pub fn mark_unavailable(&self, reason: &str) {
        if self.available.swap(false, Ordering::AcqRel) {
            warn!(collection = %self.settings.collection, %reason, "Vector index marked unavailable; images disabled");
        }
    }

    pub(crate) fn mark_populated(&self) {
        self.populated.store(true, Ordering::Release);
    }

    fn current_layout(&self) -> VectorLayout {
        self.layout
            .read()
            .map(|layout| layout.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn set_layout(&self, layout: VectorLayout) {
        match self.layout.write() {
            Ok(mut guard) => *guard = layout,
            Err(poisoned) => *poisoned.into_inner() = layout,
        }
    }

    fn spec_with(&self, layout: VectorLayout) -> CollectionSpec {
        CollectionSpec {
            dimension: self.settings.dimension,
            distance: self.settings.distance,
            layout,
        }
    }

    /// Creates the collection when absent, or adopts the vector layout of the
    /// one already there. Failures latch the index unavailable.
    pub async fn ensure_collection(&self) {
        if !self.is_available() {
            return;
        }
        let collection = &self.settings.collection;
        let result = match self.backend.collection_exists(collection).await {
            Ok(true) => {
                self.adopt_layout().await;
                Ok(())
            }
            Ok(false) => {
                info!(%collection, dimension = self.settings.dimension, "Creating vector collection");
                self.backend
                    .create_collection(collection, &self.spec_with(self.current_layout()))
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            self.mark_unavailable(&format!("could not create collection: {e}"));
        }
    }

    /// Queries must use the layout the stored collection was created with,
    /// which may differ from the configured one after a rebuild.
    async fn adopt_layout(&self) {
        let collection = &self.settings.collection;
        match self.backend.collection_layout(collection).await {
            Ok(Some(layout)) => {
                if layout != self.current_layout() {
                    info!(%collection, ?layout, "Adopting vector layout of existing collection");
                }
                self.set_layout(layout);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(%collection, error = %e, "Could not read collection layout, keeping the configured one");
            }
        }
    }

    /// Writes entries through the encoding ladder.
    ///
    /// Returns `true` when the entries were stored. Plain vectors are tried
    /// first, then the named wrapper. If the second failure looks like a schema
    /// mismatch the collection is rebuilt with an unnamed layout and the plain
    /// write is retried once. Any other outcome latches the index unavailable.
    pub async fn upsert(&self, entries: &[IndexEntry]) -> bool {
        if !self.is_available() {
            return false;
        }
        if entries.is_empty() {
            return true;
        }
        let collection = &self.settings.collection;

        let plain_err = match self
            .backend
            .upsert(collection, entries, &VectorLayout::Unnamed)
            .await
        {
            Ok(()) => {
                self.set_layout(VectorLayout::Unnamed);
                return true;
            }
            Err(e) => e,
        };
        warn!(%collection, error = %plain_err, "Plain vector upsert failed, trying named vectors");

        let named = match self.current_layout() {
            VectorLayout::Named(name) => VectorLayout::Named(name),
            VectorLayout::Unnamed => VectorLayout::Named("default".to_string()),
        };
        let named_err = match self.backend.upsert(collection, entries, &named).await {
            Ok(()) => {
                self.set_layout(named);
                return true;
            }
            Err(e) => e,
        };

        if !named_err.is_schema_mismatch() {
            self.mark_unavailable(&format!("upsert failed: {named_err}"));
            return false;
        }

        warn!(%collection, error = %named_err, "Schema mismatch detected, recreating collection with unnamed vectors");
        if let Err(e) = self.backend.delete_collection(collection).await {
            warn!(%collection, error = %e, "Failed to delete collection before recreate");
        }
        if let Err(e) = self
            .backend
            .create_collection(collection, &self.spec_with(VectorLayout::Unnamed))
            .await
        {
            self.mark_unavailable(&format!("recreate failed: {e}"));
            return false;
        }
        match self
            .backend
            .upsert(collection, entries, &VectorLayout::Unnamed)
            .await
        {
            Ok(()) => {
                self.set_layout(VectorLayout::Unnamed);
                info!(%collection, "Upserted after recreating collection with unnamed vectors");
                true
            }
            Err(e) => {
                self.mark_unavailable(&format!("retry after recreate failed: {e}"));
                false
            }
        }
    }

    /// Entry count; `Ok(0)` in degraded mode.
    pub async fn count(&self) -> Result<u64, IndexError> {
        if !self.is_available() {
            return Ok(0);
        }
        self.backend.count(&self.settings.collection).await
    }

    /// Nearest neighbours of `vector`; empty in degraded mode.
    pub async fn query_nearest(
        &self,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredEntry>, IndexError> {
        if !self.is_available() {
            return Ok(Vec::new());
        }
        let mut hits = self
            .backend
            .query(&self.settings.collection, vector, &self.current_layout(), k)
            .await?;
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    /// Runs `load` at most once for the lifetime of this index.
    ///
    /// Concurrent callers wait for the first run and share its result.
    pub async fn populate_once<F, Fut>(&self, load: F) -> usize
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = usize>,
    {
        *self.population.get_or_init(load).await
    }

    pub fn describe_backend(&self) -> String {
        self.backend.describe()
    }
}
