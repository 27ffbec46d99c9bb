//! One user's video session: upload, background indexing, search and jump.
//!
//! At most one collection is live per session. Uploading a different video
//! purges the previous collection before the new build starts, and a build
//! that was superseded never becomes the live collection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::db::{ActiveRecord, CollectionLocks, SessionRecordStore, VectorStore};
use crate::embedding::EmbeddingProvider;
use crate::error::PipelineError;
use crate::frames::FrameSampler;
use crate::identity::{identify_file, should_rebuild, VideoIdentity};
use crate::index::{is_staging_collection, IndexBuilder};
use crate::playback::{JumpRequest, PlaybackReconciler};
use crate::search::{QueryEngine, QueryResult};
use crate::tasks::{BackgroundTaskManager, TaskId, TaskProgress, TaskUpdate};

/// Tunables taken from [`Config`]
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub target_rate_hz: f64,
    pub top_k: usize,
    pub min_similarity: f32,
    pub seek_margin_secs: f64,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_rate_hz: config.sampler.target_rate_hz,
            top_k: config.search.top_k,
            min_similarity: config.search.min_similarity,
            seek_margin_secs: config.playback.seek_margin_secs,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub identity: Option<VideoIdentity>,
    pub source_path: Option<PathBuf>,
    pub indexed: bool,
    pub frame_count: Option<usize>,
    pub last_results: Vec<QueryResult>,
    pub pending_jump: Option<JumpRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    /// Same content as the active video; nothing was touched
    Unchanged { collection_id: String },
    /// New video; previous collection purged, build started
    Indexing { task_id: TaskId, collection_id: String },
    /// Same content whose earlier build never completed; build restarted
    Retrying { task_id: TaskId, collection_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Indexed { collection_id: String, frames: usize },
    BuildFailed { collection_id: String, error: String },
    BuildCancelled { collection_id: String },
    /// A superseded build finished anyway and its output was removed
    StaleDiscarded { collection_id: String },
}

pub struct VideoSession {
    builder: IndexBuilder,
    engine: QueryEngine,
    reconciler: PlaybackReconciler,
    store: Arc<dyn VectorStore>,
    records: Arc<dyn SessionRecordStore>,
    locks: Arc<CollectionLocks>,
    tasks: BackgroundTaskManager,
    current_build: Option<TaskId>,
    top_k: usize,
    state: SessionState,
}

impl VideoSession {
    pub fn new(
        sampler: Arc<dyn FrameSampler>,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        records: Arc<dyn SessionRecordStore>,
        settings: SessionSettings,
    ) -> Self {
        let locks = Arc::new(CollectionLocks::new());
        let builder = IndexBuilder::new(
            sampler,
            embedder.clone(),
            store.clone(),
            locks.clone(),
            settings.target_rate_hz,
        );
        let engine = QueryEngine::new(embedder, store.clone(), locks.clone(), settings.min_similarity);

        Self {
            builder,
            engine,
            reconciler: PlaybackReconciler::new(settings.seek_margin_secs),
            store,
            records,
            locks,
            tasks: BackgroundTaskManager::new(),
            current_build: None,
            top_k: settings.top_k,
            state: SessionState::default(),
        }
    }

    /// Reload the persisted active video and purge every other collection.
    ///
    /// Returns whether an active video was found.
    pub fn restore(&mut self) -> Result<bool, PipelineError> {
        let record = self.records.load_active()?;
        let keep = record.as_ref().map(|r| r.identity.collection_id().to_string());

        for collection in self.store.list_collections()? {
            if keep.as_deref() != Some(collection.as_str()) {
                tracing::info!(
                    collection = %collection,
                    staging = is_staging_collection(&collection),
                    "Purging orphaned collection"
                );
                self.purge(&collection)?;
            }
        }

        let Some(mut record) = record else {
            return Ok(false);
        };

        // The live collection only ever appears through a completed swap
        let collection_id = record.identity.collection_id().to_string();
        let live = self.store.collection_exists(&collection_id)?;
        if live && !record.indexed {
            let frames = self.store.count(&collection_id)?;
            record.mark_indexed(frames);
            self.records.save_active(&record)?;
        } else if !live && record.indexed {
            tracing::warn!(collection = %collection_id, "Active collection is gone; video must be re-indexed");
            record.indexed = false;
            record.frame_count = None;
            self.records.save_active(&record)?;
        }

        tracing::info!(
            collection = %collection_id,
            indexed = record.indexed,
            "Restored session"
        );

        self.state = SessionState {
            identity: Some(record.identity),
            source_path: Some(record.source_path),
            indexed: record.indexed,
            frame_count: record.frame_count,
            ..SessionState::default()
        };
        Ok(true)
    }

    pub fn upload(&mut self, video: &Path) -> Result<UploadOutcome, PipelineError> {
        let identity = identify_file(video).map_err(|source| PipelineError::VideoUnreadable {
            path: video.to_path_buf(),
            source,
        })?;
        let collection_id = identity.collection_id().to_string();

        if !should_rebuild(self.state.identity.as_ref(), &identity) {
            if self.state.indexed || self.is_building() {
                tracing::debug!(collection = %collection_id, "Upload unchanged");
                return Ok(UploadOutcome::Unchanged { collection_id });
            }
            tracing::info!(collection = %collection_id, "Retrying incomplete build");
            let task_id = self.start_build(video, &identity);
            return Ok(UploadOutcome::Retrying { task_id, collection_id });
        }

        self.tasks.cancel_all();
        if let Some(previous) = self.state.identity.clone() {
            self.purge(previous.collection_id())?;
        }

        self.records
            .save_active(&ActiveRecord::pending(identity.clone(), video.to_path_buf()))?;
        self.state = SessionState {
            identity: Some(identity.clone()),
            source_path: Some(video.to_path_buf()),
            ..SessionState::default()
        };

        let task_id = self.start_build(video, &identity);
        Ok(UploadOutcome::Indexing { task_id, collection_id })
    }

    fn start_build(&mut self, video: &Path, identity: &VideoIdentity) -> TaskId {
        let (task_id, tx, cancel_flag) = self.tasks.register_task(identity.collection_id());
        self.current_build = Some(task_id);

        let builder = self.builder.clone();
        let video = video.to_path_buf();
        let identity = identity.clone();

        std::thread::spawn(move || {
            let _ = tx.send(TaskUpdate::Started { total: 0 });

            let update = match builder.build(&video, &identity, Some(&tx), &cancel_flag) {
                Ok(result) => TaskUpdate::Completed {
                    message: format!(
                        "Indexed {} frames in {:.1}s",
                        result.frames_indexed,
                        result.elapsed.as_secs_f64()
                    ),
                },
                Err(PipelineError::Cancelled(_)) => TaskUpdate::Cancelled,
                Err(e) => {
                    tracing::error!(collection = %identity.collection_id(), error = %e, "Index build failed");
                    TaskUpdate::Failed { error: e.to_string() }
                }
            };
            let _ = tx.send(update);
        });

        task_id
    }

    /// Drain finished builds and apply their results to the session
    pub fn poll(&mut self) -> Result<Vec<SessionEvent>, PipelineError> {
        let mut events = Vec::new();

        for done in self.tasks.poll_updates() {
            if self.current_build != Some(done.id) {
                if done.success && self.active_collection() != Some(done.collection_id.as_str()) {
                    tracing::info!(collection = %done.collection_id, "Discarding superseded build");
                    self.purge(&done.collection_id)?;
                    events.push(SessionEvent::StaleDiscarded {
                        collection_id: done.collection_id,
                    });
                }
                continue;
            }

            self.current_build = None;
            let collection_id = done.collection_id;

            if done.success {
                let frames = self
                    .locks
                    .with_read(&collection_id, || self.store.count(&collection_id))?;
                self.state.indexed = true;
                self.state.frame_count = Some(frames);
                if let Some(identity) = self.state.identity.clone() {
                    let source = self.state.source_path.clone().unwrap_or_default();
                    let mut record = ActiveRecord::pending(identity, source);
                    record.mark_indexed(frames);
                    self.records.save_active(&record)?;
                }
                tracing::info!(collection = %collection_id, frames, "{}", done.message);
                events.push(SessionEvent::Indexed { collection_id, frames });
            } else if done.cancelled {
                events.push(SessionEvent::BuildCancelled { collection_id });
            } else {
                events.push(SessionEvent::BuildFailed {
                    collection_id,
                    error: done.message,
                });
            }
        }

        Ok(events)
    }

    /// Search the active video and remember the results for [`Self::jump`]
    pub fn search(&mut self, query: &str) -> Result<&[QueryResult], PipelineError> {
        let collection_id = match (&self.state.identity, self.state.indexed) {
            (Some(identity), true) => identity.collection_id().to_string(),
            _ => return Err(PipelineError::NotIndexed),
        };

        let results = self.engine.search(query, &collection_id, self.top_k)?;
        self.state.last_results = results;
        self.state.pending_jump = None;
        Ok(&self.state.last_results)
    }

    /// Queue playback of the result with 1-based `rank` from the last search
    pub fn jump(&mut self, rank: usize) -> Result<JumpRequest, PipelineError> {
        let result = self
            .state
            .last_results
            .iter()
            .find(|r| r.rank == rank)
            .ok_or(PipelineError::NoSuchResult {
                rank,
                available: self.state.last_results.len(),
            })?;

        let request = self.reconciler.jump(result);
        self.state.pending_jump = Some(request.clone());
        Ok(request)
    }

    pub fn take_pending_jump(&mut self) -> Option<JumpRequest> {
        self.state.pending_jump.take()
    }

    /// Forget the active video and delete its collection
    pub fn reset(&mut self) -> Result<(), PipelineError> {
        self.tasks.cancel_all();
        self.current_build = None;
        if let Some(identity) = self.state.identity.take() {
            self.purge(identity.collection_id())?;
        }
        self.records.clear_active()?;
        self.state = SessionState::default();
        tracing::info!("Session reset");
        Ok(())
    }

    pub fn cancel_build(&mut self) -> bool {
        match self.current_build {
            Some(id) => self.tasks.cancel_task(id),
            None => false,
        }
    }

    /// Delete a collection; absence is not an error
    fn purge(&self, collection_id: &str) -> Result<(), PipelineError> {
        let deleted = self
            .locks
            .with_write(collection_id, || self.store.delete_collection(collection_id))?;
        if !deleted {
            tracing::debug!(collection = %collection_id, "No collection to purge");
        }
        Ok(())
    }

    pub fn active_collection(&self) -> Option<&str> {
        self.state.identity.as_ref().map(|i| i.collection_id())
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn is_building(&self) -> bool {
        self.tasks.has_running_tasks()
    }

    pub fn build_progress(&self) -> Option<TaskProgress> {
        self.current_build
            .and_then(|id| self.tasks.get(id))
            .and_then(|task| task.progress.clone())
    }

    pub fn engine(&self) -> &QueryEngine {
        &self.engine
    }

    pub fn reconciler(&self) -> &PlaybackReconciler {
        &self.reconciler
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        self.tasks.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStore;
    use crate::identity::identify;
    use crate::search::DEFAULT_MIN_SIMILARITY;
    use crate::testing::{FakeEmbedder, FakeSampler, GatedSampler, BLUE, GREEN, RED};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn four_seconds() -> FakeSampler {
        FakeSampler::cycling(30.0, 4, &[RED, RED, GREEN, BLUE])
    }

    fn build_session(
        store: Arc<SqliteStore>,
        sampler: Arc<dyn FrameSampler>,
        embedder: FakeEmbedder,
    ) -> VideoSession {
        VideoSession::new(sampler, Arc::new(embedder), store.clone(), store, SessionSettings::default())
    }

    fn session_with(store: Arc<SqliteStore>, embedder: FakeEmbedder) -> VideoSession {
        build_session(store, Arc::new(four_seconds()), embedder)
    }

    fn session(store: Arc<SqliteStore>) -> VideoSession {
        session_with(store, FakeEmbedder::new())
    }

    fn write_video(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    /// Poll until no build is running, collecting events
    fn settle(session: &mut VideoSession) -> Vec<SessionEvent> {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut events = Vec::new();
        loop {
            events.extend(session.poll().unwrap());
            if !session.is_building() {
                return events;
            }
            assert!(Instant::now() < deadline, "build did not finish");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_upload_index_search_jump() {
        let dir = TempDir::new().unwrap();
        let store = crate::testing::memory_store();
        let mut session = session(store.clone());
        let video = write_video(&dir, "a.mp4", b"video a");

        let outcome = session.upload(&video).unwrap();
        let expected = identify(b"video a").collection_id().to_string();
        assert!(matches!(outcome, UploadOutcome::Indexing { ref collection_id, .. } if *collection_id == expected));

        let events = settle(&mut session);
        // 4s at 30fps sampled at 2Hz
        assert_eq!(
            events,
            vec![SessionEvent::Indexed { collection_id: expected.clone(), frames: 8 }]
        );
        assert!(session.state().indexed);

        let results = session.search("red").unwrap().to_vec();
        assert!(!results.is_empty() && results.len() <= 5);
        assert!(results.iter().all(|r| r.similarity >= DEFAULT_MIN_SIMILARITY));
        assert!(results.windows(2).all(|w| w[0].similarity >= w[1].similarity));

        let jump = session.jump(1).unwrap();
        assert_eq!(jump.exact_sec, results[0].frame.timestamp_sec);
        assert!(jump.seek_sec <= jump.exact_sec);
        assert_eq!(session.take_pending_jump(), Some(jump));

        let err = session.jump(results.len() + 1).unwrap_err();
        assert!(matches!(err, PipelineError::NoSuchResult { .. }));
    }

    #[test]
    fn test_new_video_purges_previous() {
        let dir = TempDir::new().unwrap();
        let store = crate::testing::memory_store();
        let mut session = session(store.clone());

        session.upload(&write_video(&dir, "a.mp4", b"video a")).unwrap();
        settle(&mut session);
        let a = identify(b"video a").collection_id().to_string();
        assert!(store.collection_exists(&a).unwrap());

        session.upload(&write_video(&dir, "b.mp4", b"video b")).unwrap();
        settle(&mut session);
        let b = identify(b"video b").collection_id().to_string();

        assert_eq!(store.list_collections().unwrap(), vec![b.clone()]);
        assert_eq!(session.active_collection(), Some(b.as_str()));

        let err = session.engine().search("red", &a, 5).unwrap_err();
        assert!(matches!(err, PipelineError::CollectionMissing(_)));
    }

    #[test]
    fn test_back_to_back_uploads_leave_one_collection() {
        let dir = TempDir::new().unwrap();
        let store = crate::testing::memory_store();
        let mut session = session(store.clone());

        session.upload(&write_video(&dir, "a.mp4", b"video a")).unwrap();
        session.upload(&write_video(&dir, "b.mp4", b"video b")).unwrap();
        let events = settle(&mut session);

        let b = identify(b"video b").collection_id().to_string();
        assert!(events.contains(&SessionEvent::Indexed { collection_id: b.clone(), frames: 8 }));
        assert_eq!(store.list_collections().unwrap(), vec![b]);
    }

    #[test]
    fn test_finished_superseded_build_is_discarded() {
        let dir = TempDir::new().unwrap();
        let store = crate::testing::memory_store();
        let mut session = session(store.clone());
        let a = identify(b"video a").collection_id().to_string();
        let b = identify(b"video b").collection_id().to_string();

        // Let A go live without polling, so its completion is still queued
        session.upload(&write_video(&dir, "a.mp4", b"video a")).unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while !store.collection_exists(&a).unwrap() {
            assert!(Instant::now() < deadline, "build did not finish");
            std::thread::sleep(Duration::from_millis(5));
        }

        session.upload(&write_video(&dir, "b.mp4", b"video b")).unwrap();
        let events = settle(&mut session);

        assert!(events.contains(&SessionEvent::StaleDiscarded { collection_id: a.clone() }));
        assert!(events.contains(&SessionEvent::Indexed { collection_id: b.clone(), frames: 8 }));
        assert!(!store.collection_exists(&a).unwrap());
        assert_eq!(store.list_collections().unwrap(), vec![b.clone()]);
        assert_eq!(session.active_collection(), Some(b.as_str()));
    }

    #[test]
    fn test_cancel_build_before_frames() {
        let dir = TempDir::new().unwrap();
        let store = crate::testing::memory_store();
        let (sampler, release) = GatedSampler::new(four_seconds());
        let mut session = build_session(store.clone(), Arc::new(sampler), FakeEmbedder::new());

        session.upload(&write_video(&dir, "a.mp4", b"video a")).unwrap();
        assert!(session.cancel_build());
        release.send(()).unwrap();

        let events = settle(&mut session);
        let a = identify(b"video a").collection_id().to_string();
        assert_eq!(events, vec![SessionEvent::BuildCancelled { collection_id: a }]);
        assert!(!session.state().indexed);
        assert!(store.list_collections().unwrap().is_empty());
        assert!(!session.cancel_build());
    }

    #[test]
    fn test_same_video_is_unchanged() {
        let dir = TempDir::new().unwrap();
        let store = crate::testing::memory_store();
        let mut session = session(store.clone());

        session.upload(&write_video(&dir, "a.mp4", b"video a")).unwrap();
        settle(&mut session);

        // Same bytes under another name
        let outcome = session.upload(&write_video(&dir, "copy.mp4", b"video a")).unwrap();
        assert!(matches!(outcome, UploadOutcome::Unchanged { .. }));
        assert!(!session.is_building());

        let a = identify(b"video a").collection_id().to_string();
        assert_eq!(store.count(&a).unwrap(), 8);
    }

    #[test]
    fn test_failed_build_then_retry() {
        let dir = TempDir::new().unwrap();
        let store = crate::testing::memory_store();
        let mut session = session_with(store.clone(), FakeEmbedder::failing_on(2));
        let video = write_video(&dir, "a.mp4", b"video a");

        session.upload(&video).unwrap();
        let events = settle(&mut session);
        assert!(matches!(events.as_slice(), [SessionEvent::BuildFailed { .. }]));
        assert!(!session.state().indexed);
        assert!(store.list_collections().unwrap().is_empty());
        assert!(matches!(session.search("red"), Err(PipelineError::NotIndexed)));

        let outcome = session.upload(&video).unwrap();
        assert!(matches!(outcome, UploadOutcome::Retrying { .. }));
        settle(&mut session);
        assert!(session.state().indexed);
    }

    #[test]
    fn test_unreadable_video() {
        let store = crate::testing::memory_store();
        let mut session = session(store);
        let err = session.upload(Path::new("/nonexistent/clip.mp4")).unwrap_err();
        assert!(matches!(err, PipelineError::VideoUnreadable { .. }));
        assert!(session.active_collection().is_none());
    }

    #[test]
    fn test_reset_clears_everything() {
        let dir = TempDir::new().unwrap();
        let store = crate::testing::memory_store();
        let mut session = session(store.clone());

        session.upload(&write_video(&dir, "a.mp4", b"video a")).unwrap();
        settle(&mut session);
        session.reset().unwrap();

        assert!(store.list_collections().unwrap().is_empty());
        assert!(store.load_active().unwrap().is_none());
        assert!(session.active_collection().is_none());
    }

    #[test]
    fn test_restore_after_restart() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("vidquery.db");
        let open = || {
            let store = SqliteStore::open(&db_path).unwrap();
            store.initialize().unwrap();
            Arc::new(store)
        };

        {
            let mut session = session(open());
            session.upload(&write_video(&dir, "a.mp4", b"video a")).unwrap();
            settle(&mut session);
        }

        let store = open();
        // Leftover from a build interrupted by the restart
        store
            .create_collection("video_ff__staging_1_1", crate::db::DistanceMetric::Cosine)
            .unwrap();

        let mut session = session(store.clone());
        assert!(session.restore().unwrap());

        let a = identify(b"video a").collection_id().to_string();
        assert_eq!(store.list_collections().unwrap(), vec![a.clone()]);
        assert_eq!(session.active_collection(), Some(a.as_str()));
        assert_eq!(session.state().frame_count, Some(8));
        assert!(!session.search("red").unwrap().is_empty());
    }

    #[test]
    fn test_restore_without_record() {
        let store = crate::testing::memory_store();
        store
            .create_collection("video_orphan", crate::db::DistanceMetric::Cosine)
            .unwrap();
        let mut session = session(store.clone());

        assert!(!session.restore().unwrap());
        assert!(store.list_collections().unwrap().is_empty());
    }
}
