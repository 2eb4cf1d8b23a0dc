//! A region-based, generational, mostly concurrent garbage collector.
//!
//! The heap is an array of equally sized regions. Mutators allocate young objects
//! in TLABs carved out of a shared mutator region; incremental pauses evacuate
//! every young region plus, after a marking cycle, the old regions with the most
//! garbage. Cross-region references are tracked by per-region remembered sets kept
//! up to date by a post-write barrier and a refinement thread, and old regions are
//! marked concurrently with a snapshot-at-the-beginning pre-write barrier.
//!
//! ```no_run
//! use g1::{Config, Heap, Shape};
//!
//! let heap = Heap::new(Config::default()).unwrap();
//! let mut mutator = heap.attach_current_thread();
//! let list = mutator.allocate(Shape::plain(1, 1)).unwrap();
//! let root = mutator.root(Some(list));
//! mutator.collect_young();
//! let moved = mutator.get(&root).unwrap();
//! assert_eq!(mutator.read_ref(moved, 0), None);
//! drop(mutator);
//! heap.shutdown();
//! ```

/// Aborts with a message and a backtrace when `cond` does not hold.
#[macro_export]
macro_rules! guarantee {
    ($cond: expr, $($t:tt)*) => {
        if !$cond {
            log::error!($($t)*);
            log::error!("{:?}", backtrace::Backtrace::new());
            panic!($($t)*);
        }
    };
}

#[macro_export]
macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            log::info!($($t)*);
        }
    };
}

pub mod address;
pub mod allocation;
pub mod block_offset_table;
pub mod card_table;
pub mod collection_barrier;
pub mod collection_set;
pub mod concurrent_mark;
pub mod config;
pub mod error;
pub mod evacuation;
mod full_gc;
pub mod globals;
pub mod header;
pub mod heap;
pub mod mark_bitmap;
pub mod mmap;
pub mod mutator;
mod pause;
pub mod policy;
pub mod popular;
pub mod ptr_queue;
pub mod refine;
pub mod region;
pub mod region_directory;
pub mod region_list;
pub mod remset;
pub mod roots;
pub mod safepoint;
pub mod statistics;
pub mod tlab;
pub mod verify;
pub mod young_list;
mod zero_fill;

pub use address::Address;
pub use config::Config;
pub use error::{GcError, GcResult};
pub use header::{MarkWord, ObjectKind, ObjectRef, Shape};
pub use heap::Heap;
pub use mutator::Mutator;
pub use roots::{Root, RootProvider, RootVisitor};
pub use statistics::{FullGcSummary, GcCause, GcEvent, GcStatistics, PauseKind, PauseSummary};
pub use verify::RegionCensus;

#[cfg(test)]
mod tests;
