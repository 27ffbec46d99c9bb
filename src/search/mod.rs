//! Text-to-frame search over one video's collection.

use std::sync::Arc;

use crate::db::{CollectionLocks, VectorStore};
use crate::embedding::{normalize, EmbeddingProvider};
use crate::error::PipelineError;

/// Results requested from the store per query
pub const DEFAULT_TOP_K: usize = 5;

/// Matches below this similarity are noise, not matches
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.25;

/// The matched frame, as recovered from stored metadata
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRef {
    pub timestamp_sec: f64,
    pub frame_filename: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub frame: FrameRef,
    /// Cosine similarity in [-1, 1]
    pub similarity: f32,
    /// 1-based position, best match first
    pub rank: usize,
}

impl QueryResult {
    /// Similarity for display, e.g. `31.25%`
    pub fn similarity_percent(&self) -> String {
        format!("{:.2}%", self.similarity * 100.0)
    }
}

#[derive(Clone)]
pub struct QueryEngine {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    locks: Arc<CollectionLocks>,
    min_similarity: f32,
}

impl QueryEngine {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        locks: Arc<CollectionLocks>,
        min_similarity: f32,
    ) -> Self {
        Self {
            embedder,
            store,
            locks,
            min_similarity,
        }
    }

    /// Rank the frames of `collection_id` against `text_query`.
    ///
    /// An empty vector means nothing cleared the similarity threshold. A
    /// collection that does not exist is an error, never an empty result.
    pub fn search(
        &self,
        text_query: &str,
        collection_id: &str,
        k: usize,
    ) -> Result<Vec<QueryResult>, PipelineError> {
        let text_query = text_query.trim();
        if text_query.is_empty() {
            return Err(PipelineError::EmptyQuery);
        }

        let query_embedding = self
            .embedder
            .embed_text(text_query)
            .and_then(normalize)
            .map_err(PipelineError::Embedding)?;

        let neighbors = self.locks.with_read(collection_id, || {
            self.store.query(collection_id, &query_embedding, k)
        })?;

        let results: Vec<QueryResult> = neighbors
            .into_iter()
            .map(|n| (n.metadata, (1.0 - n.distance).clamp(-1.0, 1.0)))
            .filter(|(_, similarity)| *similarity >= self.min_similarity)
            .enumerate()
            .map(|(idx, (metadata, similarity))| QueryResult {
                frame: FrameRef {
                    timestamp_sec: metadata.timestamp,
                    frame_filename: metadata.frame,
                },
                similarity,
                rank: idx + 1,
            })
            .collect();

        tracing::debug!(
            collection = %collection_id,
            query = %text_query,
            k,
            matches = results.len(),
            "Search completed"
        );

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DistanceMetric, FrameMetadata, SqliteStore};
    use crate::index::IndexBuilder;
    use crate::identity::identify;
    use crate::testing::{as_vector_store, memory_store, FakeEmbedder, FakeSampler, BLUE, GREEN, RED};
    use std::path::Path;
    use std::sync::atomic::AtomicBool;

    fn indexed_store(colors: Vec<[u8; 3]>) -> (Arc<SqliteStore>, String) {
        let store = memory_store();
        let identity = identify(b"video");
        IndexBuilder::new(
            Arc::new(FakeSampler::new(2.0, colors)),
            Arc::new(FakeEmbedder::new()),
            as_vector_store(&store),
            Arc::new(CollectionLocks::new()),
            2.0,
        )
        .build(Path::new("video.mp4"), &identity, None, &AtomicBool::new(false))
        .unwrap();
        (store, identity.collection_id().to_string())
    }

    fn engine(store: &Arc<SqliteStore>) -> QueryEngine {
        QueryEngine::new(
            Arc::new(FakeEmbedder::new()),
            as_vector_store(store),
            Arc::new(CollectionLocks::new()),
            DEFAULT_MIN_SIMILARITY,
        )
    }

    #[test]
    fn test_results_ranked_and_filtered() {
        // At 2 fps every frame is kept: red at 0.0s, 1.5s and 2.5s
        let (store, collection) = indexed_store(vec![RED, GREEN, BLUE, RED, GREEN, RED]);
        let results = engine(&store).search("a red car", &collection, 5).unwrap();

        assert_eq!(results.len(), 3);
        let ranks: Vec<usize> = results.iter().map(|r| r.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert!(results.windows(2).all(|w| w[0].similarity >= w[1].similarity));
        assert!(results.iter().all(|r| r.similarity >= DEFAULT_MIN_SIMILARITY));

        let mut stamps: Vec<f64> = results.iter().map(|r| r.frame.timestamp_sec).collect();
        stamps.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(stamps, vec![0.0, 1.5, 2.5]);
    }

    #[test]
    fn test_k_limits_results() {
        let (store, collection) = indexed_store(vec![RED; 10]);
        let results = engine(&store).search("red", &collection, 5).unwrap();
        assert_eq!(results.len(), 5);
        assert_eq!(results.last().unwrap().rank, 5);
    }

    #[test]
    fn test_no_match_is_empty_not_error() {
        let (store, collection) = indexed_store(vec![GREEN, BLUE]);
        let results = engine(&store).search("something unrelated", &collection, 5).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_empty_collection_is_empty() {
        let store = memory_store();
        store.create_collection("video_empty", DistanceMetric::Cosine).unwrap();
        let results = engine(&store).search("red", "video_empty", 5).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_missing_collection_is_state_error() {
        let store = memory_store();
        let err = engine(&store).search("red", "video_missing", 5).unwrap_err();
        assert!(matches!(err, PipelineError::CollectionMissing(ref id) if id == "video_missing"));
    }

    #[test]
    fn test_empty_query_rejected() {
        let (store, collection) = indexed_store(vec![RED]);
        let err = engine(&store).search("   ", &collection, 5).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyQuery));
    }

    #[test]
    fn test_threshold_boundary() {
        let store = memory_store();
        store.create_collection("video_t", DistanceMetric::Cosine).unwrap();
        let meta = |t: f64| FrameMetadata {
            timestamp: t,
            frame: format!("frame_{:08}ms.jpg", (t * 1000.0) as u64),
        };
        // Similarity to the "red" query direction: ~0.99 and ~0.12
        store.insert("video_t", "a", &[1.0, 0.0, 0.0], &meta(1.0)).unwrap();
        store.insert("video_t", "b", &[0.12, 0.0, 0.99], &meta(2.0)).unwrap();

        let results = engine(&store).search("red", "video_t", 5).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].frame.frame_filename, "frame_00001000ms.jpg");
    }

    #[test]
    fn test_model_mismatch_is_dependency_error() {
        let store = memory_store();
        store.create_collection("video_d", DistanceMetric::Cosine).unwrap();
        let meta = FrameMetadata {
            timestamp: 0.0,
            frame: "frame_00000000ms.jpg".to_string(),
        };
        // Indexed with a 4-d model; the query embedder is 3-d
        store.insert("video_d", "a", &[1.0, 0.0, 0.0, 0.0], &meta).unwrap();

        let err = engine(&store).search("red", "video_d", 5).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Store(crate::db::StoreError::DimensionMismatch { expected: 4, actual: 3, .. })
        ));
        assert_eq!(err.kind(), crate::error::ErrorKind::Dependency);
    }

    #[test]
    fn test_similarity_percent() {
        let result = QueryResult {
            frame: FrameRef {
                timestamp_sec: 4.5,
                frame_filename: "frame_00004500ms.jpg".to_string(),
            },
            similarity: 0.3125,
            rank: 1,
        };
        assert_eq!(result.similarity_percent(), "31.25%");
    }
}
