//! Pipeline error taxonomy.

use std::path::PathBuf;
use thiserror::Error;

use crate::db::StoreError;

/// Broad class of a pipeline failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input: unreadable or empty video, empty query, unknown rank
    Input,
    /// Sampler, embedding provider or vector store failed
    Dependency,
    /// Session or store is not in the state the operation needs
    State,
    /// A newer upload superseded the build
    Cancelled,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read video {path}: {source}")]
    VideoUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no frames could be sampled from {0}")]
    NoFrames(PathBuf),

    #[error("search query is empty")]
    EmptyQuery,

    #[error("no result with rank {rank} ({available} available)")]
    NoSuchResult { rank: usize, available: usize },

    #[error("frame sampling failed: {0}")]
    Sampling(#[source] anyhow::Error),

    #[error("embedding provider failed: {0}")]
    Embedding(#[source] anyhow::Error),

    #[error("vector store failed: {0}")]
    Store(#[source] StoreError),

    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        operation: &'static str,
        seconds: u64,
    },

    #[error("collection '{0}' does not exist")]
    CollectionMissing(String),

    #[error("no video has been indexed in this session")]
    NotIndexed,

    #[error("indexing of '{0}' was cancelled")]
    Cancelled(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::VideoUnreadable { .. }
            | PipelineError::NoFrames(_)
            | PipelineError::EmptyQuery
            | PipelineError::NoSuchResult { .. } => ErrorKind::Input,
            PipelineError::Sampling(_)
            | PipelineError::Embedding(_)
            | PipelineError::Store(_)
            | PipelineError::Timeout { .. } => ErrorKind::Dependency,
            PipelineError::CollectionMissing(_) | PipelineError::NotIndexed => ErrorKind::State,
            PipelineError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::CollectionNotFound(id) => PipelineError::CollectionMissing(id),
            other => PipelineError::Store(other),
        }
    }
}
