//! Thread-local buffers of words (dirty cards, SATB entries) and the global set of
//! completed buffers they are handed to when full.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flume::{Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};

pub struct PtrQueueSet {
    name: &'static str,
    tx: Sender<Vec<usize>>,
    rx: Receiver<Vec<usize>>,
    buffer_size: usize,
    /// Completed buffers above which the consumer thread is woken.
    process_threshold: usize,
    active: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
}

impl PtrQueueSet {
    pub fn new(name: &'static str, buffer_size: usize, process_threshold: usize, active: bool) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            name,
            tx,
            rx,
            buffer_size,
            process_threshold,
            active: AtomicBool::new(active),
            lock: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn completed_buffers(&self) -> usize {
        self.rx.len()
    }

    pub fn process_completed_buffers(&self) -> bool {
        self.completed_buffers() > self.process_threshold
    }

    pub fn enqueue_complete_buffer(&self, buf: Vec<usize>) {
        if buf.is_empty() {
            return;
        }
        // Both ends live in this struct, the channel cannot be disconnected.
        let _ = self.tx.send(buf);
        if self.process_completed_buffers() {
            self.notify();
        }
    }

    /// Takes one completed buffer, if any.
    pub fn take_completed_buffer(&self) -> Option<Vec<usize>> {
        match self.rx.try_recv() {
            Ok(buf) => Some(buf),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drops every completed buffer.
    pub fn abandon_completed_buffers(&self) -> usize {
        let mut n = 0;
        while self.take_completed_buffer().is_some() {
            n += 1;
        }
        if n > 0 {
            log::debug!("{}: abandoned {} completed buffers", self.name, n);
        }
        n
    }

    pub fn notify(&self) {
        let guard = self.lock.lock();
        self.cv.notify_all();
        drop(guard);
    }

    /// Waits until enough buffers completed, `stop` turns true, or the timeout elapses.
    pub fn wait_for_work(&self, stop: &AtomicBool, timeout: Duration) {
        let mut guard = self.lock.lock();
        if !self.process_completed_buffers() && !stop.load(Ordering::Acquire) {
            self.cv.wait_for(&mut guard, timeout);
        }
    }
}

/// A thread's current buffer.
pub struct PtrQueue {
    buf: Vec<usize>,
}

impl PtrQueue {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    #[inline]
    pub fn enqueue(&mut self, value: usize, qset: &PtrQueueSet) {
        if self.buf.capacity() == 0 {
            self.buf.reserve_exact(qset.buffer_size());
        }
        self.buf.push(value);
        if self.buf.len() >= qset.buffer_size() {
            self.flush(qset);
        }
    }

    pub fn flush(&mut self, qset: &PtrQueueSet) {
        if !self.buf.is_empty() {
            let full = std::mem::replace(&mut self.buf, Vec::with_capacity(qset.buffer_size()));
            qset.enqueue_complete_buffer(full);
        }
    }

    pub fn discard(&mut self) {
        self.buf.clear();
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Default for PtrQueue {
    fn default() -> Self {
        Self::new()
    }
}
