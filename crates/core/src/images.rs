//! Image Catalog and Resolver
//!
//! The catalog is bulk-loaded into the vector index once per process. The
//! resolver turns a free-text query into the best matching catalog image, or
//! nothing; it never fails its caller.

use anyhow::{Context, Result};
use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, sync::Arc};
use tracing::{debug, info, warn};

use crate::{
    embedding::EmbeddingProvider,
    index::{ImagePayload, IndexEntry, VectorIndex},
};

/// Concurrent embedding requests while loading the catalog.
const EMBED_CONCURRENCY: usize = 4;

/// A resolved image and its similarity score (higher is better).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageMatch {
    pub path: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogImage {
    pub path: String,
    pub description: String,
}

/// The images offered as visual aids. Entry ids are positions in the list.
#[derive(Debug, Clone, Default)]
pub struct ImageCatalog {
    images: Vec<CatalogImage>,
}

impl ImageCatalog {
    pub fn new(images: Vec<CatalogImage>) -> Self {
        Self { images }
    }

    /// Reads a JSON array of `{ "path", "description" }` objects.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read image catalog {}", path.display()))?;
        let images: Vec<CatalogImage> =
            serde_json::from_str(&raw).context("Image catalog is not a valid JSON array")?;
        Ok(Self { images })
    }

    pub fn images(&self) -> &[CatalogImage] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Loads the catalog into the index at most once per process.
///
/// Returns the number of entries written by the single run. A collection that
/// already holds data is adopted as-is and nothing is written.
pub async fn populate_index(
    index: &VectorIndex,
    embedder: &dyn EmbeddingProvider,
    catalog: &ImageCatalog,
) -> usize {
    index
        .populate_once(|| load_catalog(index, embedder, catalog))
        .await
}

async fn load_catalog(
    index: &VectorIndex,
    embedder: &dyn EmbeddingProvider,
    catalog: &ImageCatalog,
) -> usize {
    index.ensure_collection().await;
    if !index.is_available() {
        return 0;
    }

    match index.count().await {
        Ok(count) if count > 0 => {
            info!(collection = %index.collection(), count, "Vectors already persisted, skipping bulk load");
            index.mark_populated();
            return 0;
        }
        Ok(_) => {}
        Err(e) => {
            index.mark_unavailable(&format!("count failed: {e}"));
            return 0;
        }
    }

    let entries: Vec<IndexEntry> = stream::iter(catalog.images().iter().enumerate())
        .map(|(id, image)| async move {
            match embedder.embed(&image.description).await {
                Ok(vector) => Some(IndexEntry {
                    id: id as u64,
                    vector,
                    payload: ImagePayload {
                        path: image.path.clone(),
                    },
                }),
                Err(e) => {
                    warn!(path = %image.path, error = %e, "Skipping catalog image that could not be embedded");
                    None
                }
            }
        })
        .buffered(EMBED_CONCURRENCY)
        .filter_map(|entry| async move { entry })
        .collect()
        .await;

    if entries.is_empty() {
        warn!(collection = %index.collection(), "No catalog images to load; image search stays off");
        return 0;
    }

    if index.upsert(&entries).await {
        index.mark_populated();
        info!(collection = %index.collection(), count = entries.len(), "Upserted image vectors");
        entries.len()
    } else {
        0
    }
}

/// Resolves image queries against the populated index.
pub struct ImageResolver {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<VectorIndex>,
}

impl ImageResolver {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, index: Arc<VectorIndex>) -> Self {
        Self { embedder, index }
    }

    /// Best match for `query`, or `None` when the index is off, empty, or failing.
    pub async fn resolve(&self, query: &str) -> Option<ImageMatch> {
        if !self.index.is_ready() {
            debug!(%query, "Vector index not ready, skipping image search");
            return None;
        }

        let vector = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(e) => {
                warn!(%query, error = %e, "Could not embed image query");
                return None;
            }
        };

        match self.index.query_nearest(&vector, 1).await {
            Ok(hits) => hits.into_iter().next().map(|hit| {
                debug!(%query, path = %hit.payload.path, score = hit.score, "Resolved image");
                ImageMatch {
                    path: hit.payload.path,
                    score: hit.score,
                }
            }),
            Err(e) => {
                warn!(%query, error = %e, "Image search failed");
                None
            }
        }
    }
}
