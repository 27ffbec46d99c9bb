//! Durable record of which collection is live for the session.

use chrono::{DateTime, Utc};
use std::path::PathBuf;

use super::StoreError;
use crate::identity::VideoIdentity;

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveRecord {
    pub identity: VideoIdentity,
    pub source_path: PathBuf,
    pub indexed: bool,
    pub frame_count: Option<usize>,
    pub updated_at: DateTime<Utc>,
}

impl ActiveRecord {
    pub fn pending(identity: VideoIdentity, source_path: PathBuf) -> Self {
        Self {
            identity,
            source_path,
            indexed: false,
            frame_count: None,
            updated_at: Utc::now(),
        }
    }

    pub fn mark_indexed(&mut self, frame_count: usize) {
        self.indexed = true;
        self.frame_count = Some(frame_count);
        self.updated_at = Utc::now();
    }
}

pub trait SessionRecordStore: Send + Sync {
    fn load_active(&self) -> Result<Option<ActiveRecord>, StoreError>;

    /// Replace the active record
    fn save_active(&self, record: &ActiveRecord) -> Result<(), StoreError>;

    fn clear_active(&self) -> Result<(), StoreError>;
}
