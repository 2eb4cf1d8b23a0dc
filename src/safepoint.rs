//! Stop-the-world coordination.
//!
//! Every thread that touches the heap outside of a pause (mutators, the concurrent
//! marker, the refinement and zero-fill threads) is a registered participant. A
//! pause is started by arming the barrier and waiting until every running
//! participant has either parked at a poll or entered a safe region. Ending the
//! pause advances the phase counter and releases everyone.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

struct State {
    phase: u64,
    armed: bool,
    /// Registered participants that are neither parked nor in a safe region.
    running: usize,
    registered: usize,
}

pub struct Safepoint {
    state: Mutex<State>,
    cv_stopped: Condvar,
    cv_resume: Condvar,
    armed: AtomicBool,
}

impl Safepoint {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                phase: 0,
                armed: false,
                running: 0,
                registered: 0,
            }),
            cv_stopped: Condvar::new(),
            cv_resume: Condvar::new(),
            armed: AtomicBool::new(false),
        }
    }

    /// Registers the calling thread as a running participant. Waits out a pause
    /// that is already in progress.
    pub fn register(&self) {
        let mut state = self.state.lock();
        while state.armed {
            self.cv_resume.wait(&mut state);
        }
        state.running += 1;
        state.registered += 1;
    }

    pub fn unregister(&self) {
        let mut state = self.state.lock();
        state.running -= 1;
        state.registered -= 1;
        self.cv_stopped.notify_all();
    }

    pub fn registered(&self) -> usize {
        self.state.lock().registered
    }

    pub fn phase(&self) -> u64 {
        self.state.lock().phase
    }

    #[inline(always)]
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Parks the calling participant until the current pause is over.
    #[cold]
    #[inline(never)]
    pub fn park(&self) {
        let mut state = self.state.lock();
        if !state.armed {
            return;
        }
        let phase = state.phase;
        state.running -= 1;
        self.cv_stopped.notify_all();
        while state.armed && state.phase == phase {
            self.cv_resume.wait(&mut state);
        }
        state.running += 1;
    }

    /// Marks the calling participant as safe until the guard is dropped. The thread
    /// must not touch the heap while the guard is alive.
    pub fn enter_safe_region(&self) -> SafeRegion<'_> {
        let mut state = self.state.lock();
        state.running -= 1;
        self.cv_stopped.notify_all();
        SafeRegion { safepoint: self }
    }

    fn leave_safe_region(&self) {
        let mut state = self.state.lock();
        while state.armed {
            self.cv_resume.wait(&mut state);
        }
        state.running += 1;
    }

    /// Stops the world. `participant` tells whether the caller is itself a
    /// registered, running participant.
    ///
    /// Returns `None` when another thread already armed the barrier; a participant
    /// must then park, anyone else should wait with [`wait_while_armed`](Self::wait_while_armed).
    pub fn begin_pause(&self, participant: bool) -> Option<PauseScope<'_>> {
        let mut state = self.state.lock();
        if state.armed {
            return None;
        }
        state.armed = true;
        self.armed.store(true, Ordering::Release);
        if participant {
            state.running -= 1;
        }
        while state.running > 0 {
            self.cv_stopped.wait(&mut state);
        }
        log::trace!("safepoint reached in phase {}", state.phase);
        Some(PauseScope {
            safepoint: self,
            participant,
        })
    }

    fn end_pause(&self, participant: bool) {
        let mut state = self.state.lock();
        state.armed = false;
        state.phase += 1;
        self.armed.store(false, Ordering::Release);
        if participant {
            state.running += 1;
        }
        self.cv_resume.notify_all();
    }

    /// Blocks a non-participant until no pause is in progress.
    pub fn wait_while_armed(&self) {
        let mut state = self.state.lock();
        while state.armed {
            self.cv_resume.wait(&mut state);
        }
    }
}

impl Default for Safepoint {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SafeRegion<'a> {
    safepoint: &'a Safepoint,
}

impl Drop for SafeRegion<'_> {
    fn drop(&mut self) {
        self.safepoint.leave_safe_region();
    }
}

/// The world stays stopped while this is alive.
pub struct PauseScope<'a> {
    safepoint: &'a Safepoint,
    participant: bool,
}

impl Drop for PauseScope<'_> {
    fn drop(&mut self) {
        self.safepoint.end_pause(self.participant);
    }
}
