//! Per-video index construction.
//!
//! Frames are sampled and embedded first; nothing touches the store until
//! every frame has an embedding. The vectors are then written to a staging
//! collection that replaces the live collection in one step, so a query never
//! sees a missing or half-written collection.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use crate::db::{CollectionLocks, DistanceMetric, FrameMetadata, VectorStore};
use crate::embedding::{normalize, EmbeddingProvider};
use crate::error::PipelineError;
use crate::frames::{Frame, FrameSampler};
use crate::identity::VideoIdentity;
use crate::tasks::{TaskProgress, TaskUpdate};

/// Marker of the collections a build writes into before they go live
pub const STAGING_MARKER: &str = "__staging_";

/// Staging collection for one build; distinct per build so overlapping
/// builds of the same video never share one
pub fn staging_collection_id(collection_id: &str) -> String {
    static BUILD_COUNTER: AtomicU64 = AtomicU64::new(1);
    let build = BUILD_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}{}{}_{}", collection_id, STAGING_MARKER, std::process::id(), build)
}

pub fn is_staging_collection(name: &str) -> bool {
    name.contains(STAGING_MARKER)
}

/// Vector id for a frame; unique because frame filenames are timestamp-derived
pub fn frame_vector_id(collection_id: &str, frame_filename: &str) -> String {
    format!("{}_{}", collection_id, frame_filename)
}

#[derive(Debug, Clone)]
pub struct IndexResult {
    pub collection_id: String,
    pub frames_indexed: usize,
    pub elapsed: Duration,
}

#[derive(Clone)]
pub struct IndexBuilder {
    sampler: Arc<dyn FrameSampler>,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    locks: Arc<CollectionLocks>,
    target_rate_hz: f64,
}

impl IndexBuilder {
    pub fn new(
        sampler: Arc<dyn FrameSampler>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        locks: Arc<CollectionLocks>,
        target_rate_hz: f64,
    ) -> Self {
        Self {
            sampler,
            embedder,
            store,
            locks,
            target_rate_hz,
        }
    }

    /// Populate `identity`'s collection from `video`.
    ///
    /// On success the collection holds exactly one vector per sampled frame
    /// and replaces whatever was stored under that id before. On any failure
    /// the previous collection (if any) is left as it was.
    pub fn build(
        &self,
        video: &Path,
        identity: &VideoIdentity,
        progress: Option<&mpsc::Sender<TaskUpdate>>,
        cancel: &AtomicBool,
    ) -> Result<IndexResult, PipelineError> {
        let started = Instant::now();
        let collection_id = identity.collection_id();

        tracing::info!(
            collection = %collection_id,
            video = %video.display(),
            rate_hz = self.target_rate_hz,
            "Indexing video"
        );

        let frames = self.embed_frames(video, identity, progress, cancel)?;
        if frames.is_empty() {
            tracing::warn!(video = %video.display(), "No frames sampled");
            return Err(PipelineError::NoFrames(video.to_path_buf()));
        }

        let staging = staging_collection_id(collection_id);
        if let Err(e) = self.stage(&staging, collection_id, &frames, progress, cancel) {
            self.discard_staging(&staging);
            return Err(e);
        }

        self.locks.with_write(collection_id, || -> Result<(), PipelineError> {
            // A superseded build must not go live
            if cancel.load(Ordering::SeqCst) {
                return Err(PipelineError::Cancelled(collection_id.to_string()));
            }
            self.store.rename_collection(&staging, collection_id)?;
            Ok(())
        })
        .inspect_err(|_| self.discard_staging(&staging))?;

        let result = IndexResult {
            collection_id: collection_id.to_string(),
            frames_indexed: frames.len(),
            elapsed: started.elapsed(),
        };

        tracing::info!(
            collection = %collection_id,
            frames = result.frames_indexed,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Video indexed"
        );

        Ok(result)
    }

    /// Sample the video and embed every kept frame
    fn embed_frames(
        &self,
        video: &Path,
        identity: &VideoIdentity,
        progress: Option<&mpsc::Sender<TaskUpdate>>,
        cancel: &AtomicBool,
    ) -> Result<Vec<Frame>, PipelineError> {
        let stream = self
            .sampler
            .sample(video, self.target_rate_hz)
            .map_err(PipelineError::Sampling)?;

        let mut frames = Vec::new();
        for sampled in stream {
            if cancel.load(Ordering::SeqCst) {
                return Err(PipelineError::Cancelled(identity.collection_id().to_string()));
            }

            let sampled = sampled.map_err(PipelineError::Sampling)?;
            let filename = sampled.filename();

            if let Some(tx) = progress {
                let _ = tx.send(TaskUpdate::Progress(
                    TaskProgress::new(frames.len() + 1, 0)
                        .with_item(&filename)
                        .with_message("Embedding frames"),
                ));
            }

            let embedding = self
                .embedder
                .embed_image(&sampled.image)
                .and_then(normalize)
                .map_err(|e| {
                    tracing::error!(frame = %filename, error = %e, "Failed to embed frame");
                    PipelineError::Embedding(e)
                })?;

            frames.push(Frame {
                timestamp_ms: sampled.timestamp_ms,
                embedding,
                source_filename: filename,
            });
        }

        tracing::debug!(
            collection = %identity.collection_id(),
            frames = frames.len(),
            model = self.embedder.model_name(),
            "Frames embedded"
        );
        Ok(frames)
    }

    /// Write all frames into a fresh staging collection
    fn stage(
        &self,
        staging: &str,
        collection_id: &str,
        frames: &[Frame],
        progress: Option<&mpsc::Sender<TaskUpdate>>,
        cancel: &AtomicBool,
    ) -> Result<(), PipelineError> {
        self.store.create_collection(staging, DistanceMetric::Cosine)?;

        let total = frames.len();
        for (idx, frame) in frames.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                return Err(PipelineError::Cancelled(collection_id.to_string()));
            }

            let metadata = FrameMetadata {
                timestamp: frame.timestamp_sec(),
                frame: frame.source_filename.clone(),
            };
            self.store.insert(
                staging,
                &frame_vector_id(collection_id, &frame.source_filename),
                &frame.embedding,
                &metadata,
            )?;

            if let Some(tx) = progress {
                let _ = tx.send(TaskUpdate::Progress(
                    TaskProgress::new(idx + 1, total).with_message("Writing index"),
                ));
            }
        }

        Ok(())
    }

    fn discard_staging(&self, staging: &str) {
        if let Err(e) = self.store.delete_collection(staging) {
            tracing::warn!(collection = %staging, error = %e, "Failed to remove staging collection");
        }
    }
}
