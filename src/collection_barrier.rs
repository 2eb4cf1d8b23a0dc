use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// Gate that holds back new pauses while the regions freed by a marking cleanup
/// are still being handed back to the free lists.
pub struct CollectionBarrier {
    mutex: Mutex<()>,
    cv_wakeup: Condvar,
    cleanup_in_progress: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl CollectionBarrier {
    pub fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
            cv_wakeup: Condvar::new(),
            cleanup_in_progress: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn is_cleanup_in_progress(&self) -> bool {
        self.cleanup_in_progress.load(Ordering::Acquire)
    }

    pub fn begin_cleanup(&self) {
        let guard = self.mutex.lock();
        self.cleanup_in_progress.store(true, Ordering::Release);
        drop(guard);
    }

    pub fn complete_cleanup(&self) {
        let guard = self.mutex.lock();
        self.cleanup_in_progress.store(false, Ordering::Release);
        self.cv_wakeup.notify_all();
        drop(guard);
    }

    /// Blocks until no cleanup is in progress. The caller must not hold the heap
    /// lock and must not be counted as running at the safepoint.
    pub fn wait_for_cleanup_complete(&self) {
        if !self.is_cleanup_in_progress() {
            return;
        }
        let mut guard = self.mutex.lock();
        while self.is_cleanup_in_progress() && !self.shutdown_requested.load(Ordering::Acquire) {
            self.cv_wakeup.wait(&mut guard);
        }
    }

    pub fn notify_shutdown_requested(&self) {
        let guard = self.mutex.lock();
        self.shutdown_requested.store(true, Ordering::Release);
        self.cv_wakeup.notify_all();
        drop(guard);
    }
}

impl Default for CollectionBarrier {
    fn default() -> Self {
        Self::new()
    }
}
