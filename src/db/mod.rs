//! Collection-scoped vector storage.
//!
//! The pipeline only talks to storage through [`VectorStore`] and
//! [`SessionRecordStore`]; [`SqliteStore`] implements both on one database.

mod schema;
pub mod embeddings;
pub mod locks;
pub mod session;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use locks::CollectionLocks;
pub use schema::SCHEMA;
pub use session::{ActiveRecord, SessionRecordStore};
pub use sqlite::SqliteStore;

/// Distance metric a collection is configured with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
}

impl DistanceMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cosine" => Some(DistanceMetric::Cosine),
            _ => None,
        }
    }
}

/// Metadata stored with every frame vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// Seconds from the start of the video
    pub timestamp: f64,
    /// Timestamp-derived frame filename, e.g. `frame_00001500ms.jpg`
    pub frame: String,
}

/// One nearest-neighbor hit
#[derive(Debug, Clone)]
pub struct Neighbor {
    pub id: String,
    pub metadata: FrameMetadata,
    pub distance: f32,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("collection '{0}' not found")]
    CollectionNotFound(String),

    #[error("collection '{0}' already exists")]
    CollectionExists(String),

    #[error("collection '{collection}' holds {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch {
        collection: String,
        expected: usize,
        actual: usize,
    },

    #[error("unknown distance metric '{0}'")]
    UnknownMetric(String),

    #[error("database lock poisoned")]
    Poisoned,

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Persistent, collection-scoped nearest-neighbor index
pub trait VectorStore: Send + Sync {
    /// Create an empty collection; fails if the name is taken
    fn create_collection(&self, id: &str, metric: DistanceMetric) -> Result<(), StoreError>;

    /// Delete a collection and its vectors. Returns false if it did not exist.
    fn delete_collection(&self, id: &str) -> Result<bool, StoreError>;

    /// Insert one vector with its metadata
    fn insert(
        &self,
        collection_id: &str,
        id: &str,
        vector: &[f32],
        metadata: &FrameMetadata,
    ) -> Result<(), StoreError>;

    /// The `k` nearest vectors, ordered by ascending distance
    fn query(&self, collection_id: &str, vector: &[f32], k: usize)
        -> Result<Vec<Neighbor>, StoreError>;

    /// Number of vectors in a collection
    fn count(&self, collection_id: &str) -> Result<usize, StoreError>;

    fn collection_exists(&self, id: &str) -> Result<bool, StoreError>;

    fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    /// Atomically move `from` onto `to`, replacing any existing `to`
    fn rename_collection(&self, from: &str, to: &str) -> Result<(), StoreError>;
}
