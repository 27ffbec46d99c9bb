//! Background task manager for tracking and controlling concurrent tasks.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc;
use std::sync::Arc;

use super::{BackgroundTask, TaskCompletionInfo, TaskId, TaskProgress, TaskState, TaskUpdate};

/// Tracks index builds and their channels.
pub struct BackgroundTaskManager {
    tasks: HashMap<TaskId, BackgroundTask>,
    /// Order in which tasks were added
    task_order: Vec<TaskId>,
}

impl BackgroundTaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            task_order: Vec::new(),
        }
    }

    /// Register a new background task for `collection_id`.
    /// Returns the TaskId, a sender for the task to send updates, and its cancel flag.
    pub fn register_task(
        &mut self,
        collection_id: &str,
    ) -> (TaskId, mpsc::Sender<TaskUpdate>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let task = BackgroundTask::new(collection_id, cancel_flag.clone(), rx);
        let id = task.id;

        self.tasks.insert(id, task);
        self.task_order.push(id);

        (id, tx, cancel_flag)
    }

    /// Cancel a specific task by ID.
    pub fn cancel_task(&mut self, id: TaskId) -> bool {
        if let Some(task) = self.tasks.get(&id) {
            if task.is_running() {
                task.cancel();
                return true;
            }
        }
        false
    }

    /// Cancel all running tasks.
    pub fn cancel_all(&mut self) {
        for task in self.tasks.values() {
            if task.is_running() {
                task.cancel();
            }
        }
    }

    /// Poll all task channels for updates.
    /// Returns one entry per task that finished since the last poll.
    pub fn poll_updates(&mut self) -> Vec<TaskCompletionInfo> {
        let mut completed = Vec::new();

        for id in self.task_order.clone() {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };

            loop {
                let update = match task.receiver.try_recv() {
                    Ok(update) => update,
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => {
                        // Worker exited without a final update (panicked)
                        if task.is_running() {
                            task.state = TaskState::Failed;
                            completed.push(TaskCompletionInfo {
                                id,
                                collection_id: task.collection_id.clone(),
                                message: "Build worker exited unexpectedly".to_string(),
                                success: false,
                                cancelled: false,
                            });
                        }
                        break;
                    }
                };

                match update {
                    TaskUpdate::Started { total } => {
                        task.progress = Some(TaskProgress::new(0, total));
                    }
                    TaskUpdate::Progress(progress) => {
                        task.progress = Some(progress);
                    }
                    TaskUpdate::Completed { message } => {
                        task.state = TaskState::Completed;
                        completed.push(TaskCompletionInfo {
                            id,
                            collection_id: task.collection_id.clone(),
                            message,
                            success: true,
                            cancelled: false,
                        });
                    }
                    TaskUpdate::Cancelled => {
                        task.state = TaskState::Cancelled;
                        completed.push(TaskCompletionInfo {
                            id,
                            collection_id: task.collection_id.clone(),
                            message: "Cancelled".to_string(),
                            success: false,
                            cancelled: true,
                        });
                    }
                    TaskUpdate::Failed { error } => {
                        task.state = TaskState::Failed;
                        completed.push(TaskCompletionInfo {
                            id,
                            collection_id: task.collection_id.clone(),
                            message: error,
                            success: false,
                            cancelled: false,
                        });
                    }
                }

                if !task.is_running() {
                    break;
                }
            }
        }

        // Remove completed tasks from tracking
        for info in &completed {
            self.tasks.remove(&info.id);
            self.task_order.retain(|id| *id != info.id);
        }

        completed
    }

    pub fn get(&self, id: TaskId) -> Option<&BackgroundTask> {
        self.tasks.get(&id)
    }

    /// Check if any tasks are running.
    pub fn has_running_tasks(&self) -> bool {
        self.tasks.values().any(|t| t.is_running())
    }
}

impl Default for BackgroundTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_progress_then_completion() {
        let mut manager = BackgroundTaskManager::new();
        let (id, tx, _cancel) = manager.register_task("video_ab");

        tx.send(TaskUpdate::Started { total: 0 }).unwrap();
        tx.send(TaskUpdate::Progress(TaskProgress::new(3, 10))).unwrap();
        assert!(manager.poll_updates().is_empty());
        assert_eq!(manager.get(id).unwrap().progress.as_ref().unwrap().percent(), 30);
        assert!(manager.has_running_tasks());

        tx.send(TaskUpdate::Completed { message: "10 frames".to_string() }).unwrap();
        let done = manager.poll_updates();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].collection_id, "video_ab");
        assert!(done[0].success);
        assert!(!manager.has_running_tasks());
        assert!(manager.get(id).is_none());
    }

    #[test]
    fn test_cancel_all_sets_flags() {
        let mut manager = BackgroundTaskManager::new();
        let (_, _tx1, flag1) = manager.register_task("video_a");
        let (_, _tx2, flag2) = manager.register_task("video_b");

        manager.cancel_all();
        assert!(flag1.load(Ordering::SeqCst));
        assert!(flag2.load(Ordering::SeqCst));
        // Still tracked until the workers acknowledge
        assert!(manager.has_running_tasks());
    }

    #[test]
    fn test_dropped_sender_reports_failure() {
        let mut manager = BackgroundTaskManager::new();
        let (_, tx, _) = manager.register_task("video_a");
        drop(tx);

        let done = manager.poll_updates();
        assert_eq!(done.len(), 1);
        assert!(!done[0].success);
    }
}
