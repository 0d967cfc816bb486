//! In-process vector backend used for offline runs and tests.
//!
//! Collections remember the layout they were created with and refuse writes in
//! the other encoding with the same complaint the remote store produces, so the
//! index's recovery path behaves identically against it.

use super::{
    CollectionSpec, Distance, IndexEntry, IndexError, ScoredEntry, VectorBackend, VectorLayout,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

struct Collection {
    spec: CollectionSpec,
    entries: BTreeMap<u64, IndexEntry>,
}

#[derive(Default)]
pub struct InMemoryBackend {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn rejected(body: String) -> IndexError {
    IndexError::Rejected { status: 400, body }
}

fn unknown_vector_name(layout: &VectorLayout) -> IndexError {
    match layout {
        VectorLayout::Unnamed => rejected("Wrong input: Not existing vector name error: ".to_string()),
        VectorLayout::Named(name) => {
            rejected(format!("Wrong input: Not existing vector name error: {name}"))
        }
    }
}

fn not_found(collection: &str) -> IndexError {
    IndexError::Rejected {
        status: 404,
        body: format!("Collection `{collection}` doesn't exist!"),
    }
}

fn similarity(distance: Distance, a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    match distance {
        Distance::Dot => dot,
        Distance::Cosine => {
            let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                0.0
            } else {
                dot / (norm_a * norm_b)
            }
        }
        // Higher is better everywhere, so Euclid scores are negated distances.
        Distance::Euclid => -a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    }
}

#[async_trait]
impl VectorBackend for InMemoryBackend {
    fn describe(&self) -> String {
        "in-memory".to_string()
    }

    async fn collection_exists(&self, collection: &str) -> Result<bool, IndexError> {
        Ok(self.collections.read().await.contains_key(collection))
    }

    async fn collection_layout(
        &self,
        collection: &str,
    ) -> Result<Option<VectorLayout>, IndexError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|c| c.spec.layout.clone()))
    }

    async fn create_collection(
        &self,
        collection: &str,
        spec: &CollectionSpec,
    ) -> Result<(), IndexError> {
        let mut collections = self.collections.write().await;
        if collections.contains_key(collection) {
            return Err(rejected(format!(
                "Wrong input: Collection `{collection}` already exists!"
            )));
        }
        collections.insert(
            collection.to_string(),
            Collection {
                spec: spec.clone(),
                entries: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_collection(&self, collection: &str) -> Result<(), IndexError> {
        self.collections.write().await.remove(collection);
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        entries: &[IndexEntry],
        encoding: &VectorLayout,
    ) -> Result<(), IndexError> {
        let mut collections = self.collections.write().await;
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| not_found(collection))?;

        if *encoding != target.spec.layout {
            return Err(unknown_vector_name(encoding));
        }
        if let Some(bad) = entries
            .iter()
            .find(|e| e.vector.len() != target.spec.dimension)
        {
            return Err(rejected(format!(
                "Wrong input: Vector dimension error: expected dim: {}, got {}",
                target.spec.dimension,
                bad.vector.len()
            )));
        }

        for entry in entries {
            target.entries.insert(entry.id, entry.clone());
        }
        Ok(())
    }

    async fn count(&self, collection: &str) -> Result<u64, IndexError> {
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|c| c.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        layout: &VectorLayout,
        limit: usize,
    ) -> Result<Vec<ScoredEntry>, IndexError> {
        let collections = self.collections.read().await;
        let Some(target) = collections.get(collection) else {
            return Ok(Vec::new());
        };
        if *layout != target.spec.layout {
            return Err(unknown_vector_name(layout));
        }

        let mut hits: Vec<ScoredEntry> = target
            .entries
            .values()
            .map(|entry| ScoredEntry {
                id: entry.id,
                payload: entry.payload.clone(),
                score: similarity(target.spec.distance, vector, &entry.vector),
            })
            .collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{ImagePayload, IndexSettings, VectorIndex};
    use approx::assert_relative_eq;

    fn entry(id: u64, vector: Vec<f32>, path: &str) -> IndexEntry {
        IndexEntry {
            id,
            vector,
            payload: ImagePayload {
                path: path.to_string(),
            },
        }
    }

    fn spec(layout: VectorLayout) -> CollectionSpec {
        CollectionSpec {
            dimension: 2,
            distance: Distance::Cosine,
            layout,
        }
    }

    #[tokio::test]
    async fn test_query_orders_by_descending_similarity() {
        let backend = InMemoryBackend::new();
        backend
            .create_collection("c", &spec(VectorLayout::Unnamed))
            .await
            .unwrap();
        backend
            .upsert(
                "c",
                &[
                    entry(0, vec![1.0, 0.0], "east.png"),
                    entry(1, vec![0.0, 1.0], "north.png"),
                    entry(2, vec![1.0, 1.0], "north_east.png"),
                ],
                &VectorLayout::Unnamed,
            )
            .await
            .unwrap();

        let hits = backend
            .query("c", &[0.9, 0.1], &VectorLayout::Unnamed, 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].payload.path, "east.png");
        assert_eq!(hits[1].payload.path, "north_east.png");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_same_id_overwrites() {
        let backend = InMemoryBackend::new();
        backend
            .create_collection("c", &spec(VectorLayout::Unnamed))
            .await
            .unwrap();
        let layout = VectorLayout::Unnamed;
        backend
            .upsert("c", &[entry(0, vec![1.0, 0.0], "old.png")], &layout)
            .await
            .unwrap();
        backend
            .upsert("c", &[entry(0, vec![1.0, 0.0], "new.png")], &layout)
            .await
            .unwrap();
        assert_eq!(backend.count("c").await.unwrap(), 1);
        let hits = backend.query("c", &[1.0, 0.0], &layout, 1).await.unwrap();
        assert_eq!(hits[0].payload.path, "new.png");
        assert_relative_eq!(hits[0].score, 1.0, epsilon = 1e-6);
    }

    #[tokio::test]
    async fn test_absent_collection_is_empty_not_error() {
        let backend = InMemoryBackend::new();
        assert_eq!(backend.count("missing").await.unwrap(), 0);
        assert!(
            backend
                .query("missing", &[1.0, 0.0], &VectorLayout::Unnamed, 1)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_layout_mismatch_is_a_schema_error() {
        let backend = InMemoryBackend::new();
        backend
            .create_collection("c", &spec(VectorLayout::Named("default".to_string())))
            .await
            .unwrap();
        let err = backend
            .upsert("c", &[entry(0, vec![1.0, 0.0], "a.png")], &VectorLayout::Unnamed)
            .await
            .unwrap_err();
        assert!(err.is_schema_mismatch());
    }

    #[tokio::test]
    async fn test_query_in_wrong_layout_is_rejected() {
        let backend = InMemoryBackend::new();
        backend
            .create_collection("c", &spec(VectorLayout::Unnamed))
            .await
            .unwrap();
        let err = backend
            .query("c", &[1.0, 0.0], &VectorLayout::Named("default".to_string()), 1)
            .await
            .unwrap_err();
        assert!(err.is_schema_mismatch());
        assert_eq!(
            backend.collection_layout("c").await.unwrap(),
            Some(VectorLayout::Unnamed)
        );
        assert_eq!(backend.collection_layout("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_index_adopts_named_layout_of_existing_collection() {
        let index = VectorIndex::new(
            std::sync::Arc::new(InMemoryBackend::new()),
            IndexSettings::new("c", 2),
        );
        index.ensure_collection().await;
        assert!(index.upsert(&[entry(0, vec![0.0, 1.0], "a.png")]).await);
        assert_eq!(index.count().await.unwrap(), 1);
        let hits = index.query_nearest(&[0.0, 1.0], 1).await.unwrap();
        assert_eq!(hits[0].payload.path, "a.png");
    }
}
