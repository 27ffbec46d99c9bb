//! Per-collection reader/writer locks.
//!
//! Queries run under a read lock on their collection; delete and swap run
//! under the write lock, so a mutation never interleaves with a query.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

#[derive(Default)]
pub struct CollectionLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl CollectionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, collection_id: &str) -> Arc<RwLock<()>> {
        // Poisoning only means another thread panicked while holding the map; it is still consistent
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(collection_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Run `f` while holding a shared lock on `collection_id`
    pub fn with_read<T>(&self, collection_id: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(collection_id);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());
        f()
    }

    /// Run `f` while holding the exclusive lock on `collection_id`
    pub fn with_write<T>(&self, collection_id: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.lock_for(collection_id);
        let _guard = lock.write().unwrap_or_else(|e| e.into_inner());
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn test_write_waits_for_reader() {
        let locks = Arc::new(CollectionLocks::new());
        let reading = Arc::new(AtomicBool::new(false));
        let wrote_during_read = Arc::new(AtomicBool::new(false));

        let reader = {
            let locks = locks.clone();
            let reading = reading.clone();
            std::thread::spawn(move || {
                locks.with_read("video_a", || {
                    reading.store(true, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(100));
                    reading.store(false, Ordering::SeqCst);
                });
            })
        };

        while !reading.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }

        locks.with_write("video_a", || {
            if reading.load(Ordering::SeqCst) {
                wrote_during_read.store(true, Ordering::SeqCst);
            }
        });

        reader.join().unwrap();
        assert!(!wrote_during_read.load(Ordering::SeqCst));
    }

    #[test]
    fn test_collections_are_independent() {
        let locks = CollectionLocks::new();
        let value = locks.with_write("video_a", || locks.with_write("video_b", || 7));
        assert_eq!(value, 7);
    }
}
