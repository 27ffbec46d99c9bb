//! Background task management for non-blocking operations.
//!
//! Index builds run on worker threads and report back over channels; the
//! session polls for updates instead of blocking on the build.

pub mod manager;

use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;

pub use manager::BackgroundTaskManager;

/// Unique identifier for a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TaskId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress information for a task.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
    pub current_item: Option<String>,
    pub message: Option<String>,
}

impl TaskProgress {
    pub fn new(current: usize, total: usize) -> Self {
        Self {
            current,
            total,
            current_item: None,
            message: None,
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Calculate progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

/// State of a background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Update messages sent from background tasks via channels.
#[derive(Debug, Clone)]
pub enum TaskUpdate {
    /// Task has started; `total` is 0 while unknown.
    Started { total: usize },
    /// Progress update during processing.
    Progress(TaskProgress),
    /// Task completed successfully.
    Completed { message: String },
    /// Task was cancelled.
    Cancelled,
    /// Task failed with error.
    Failed { error: String },
}

/// A running background task with its state and communication channels.
pub struct BackgroundTask {
    pub id: TaskId,
    /// Collection the task is building
    pub collection_id: String,
    pub state: TaskState,
    pub progress: Option<TaskProgress>,
    pub cancel_flag: Arc<AtomicBool>,
    pub receiver: mpsc::Receiver<TaskUpdate>,
}

impl BackgroundTask {
    /// Create a new background task.
    pub fn new(
        collection_id: impl Into<String>,
        cancel_flag: Arc<AtomicBool>,
        receiver: mpsc::Receiver<TaskUpdate>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            collection_id: collection_id.into(),
            state: TaskState::Running,
            progress: None,
            cancel_flag,
            receiver,
        }
    }

    /// Request cancellation of this task.
    pub fn cancel(&self) {
        self.cancel_flag
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Check if task is still running.
    pub fn is_running(&self) -> bool {
        self.state == TaskState::Running
    }
}

/// Result of polling task updates.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskCompletionInfo {
    pub id: TaskId,
    pub collection_id: String,
    pub message: String,
    pub success: bool,
    /// Stopped on request rather than by an error
    pub cancelled: bool,
}
