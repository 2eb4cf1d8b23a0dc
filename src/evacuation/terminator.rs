use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::Backoff;

/// Termination protocol for the evacuation workers.
///
/// A worker that ran out of local and stealable work offers termination by
/// decrementing the count of active workers. Termination is granted once the count
/// reaches zero. A worker that sees a non-zero count after backing off withdraws
/// its offer and goes back to stealing.
pub struct Terminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl Terminator {
    pub fn new(number_workers: usize) -> Terminator {
        Terminator {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    pub fn try_terminate(&self) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            // reached 0, no need to wait
            return true;
        }

        let backoff = Backoff::new();
        while !backoff.is_completed() {
            if self.nworkers.load(Ordering::Acquire) == 0 {
                return true;
            }
            backoff.snooze();
        }
        self.zero_or_increase_workers()
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Acquire);

        loop {
            if nworkers == 0 {
                return true;
            }

            match self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // Offer withdrawn: somebody is still working and may publish more.
                Ok(_) => return false,
                Err(prev_nworkers) => nworkers = prev_nworkers,
            }
        }
    }
}
