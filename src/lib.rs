//! # RcImmix
//!
//! RcImmix is a garbage collection library for VMs implemented in Rust. It combines
//! deferred reference counting with an Immix block/line heap: mutators pay a coalescing
//! write barrier and everything else (count maintenance, reclamation, cycle detection)
//! happens on collector threads, either inside a stop-the-world pause or concurrently
//! in the background.
//!
//! # Features
//! - Deferred, buffered reference counting: mutators never block on reclamation
//! - Background draining of the decrement backlog while mutators keep running
//! - A backup trace that reclaims reference cycles and optionally defragments the heap
//! - Support for multiple mutator threads attached to one heap
//!
//! The heap is driven through [`plan::RcImmix`]; application threads allocate and write
//! through a [`mutator::Mutator`] bound to it.

pub mod allocator;
pub mod backup_trace;
pub mod collector;
pub mod deque;
pub mod forwarding;
pub mod header;
pub mod immix_space;
pub mod immortal_space;
pub mod large_space;
pub mod mutator;
pub mod object;
pub mod plan;
pub mod safepoint;
pub mod scheduler;
pub mod trace;

#[cfg(test)]
mod tests;

/// Rounds `value` up to the nearest multiple of `align`. `align` must be a power of two.
#[inline(always)]
pub const fn align_usize(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Granularity of all heap allocations. Object sizes and payload offsets are
/// multiples of this.
pub const ALLOCATION_GRANULARITY: usize = 8;

macro_rules! gc_log {
    ($($arg:tt)*) => {
        #[cfg(feature = "gc_logging")]
        tracing::debug!($($arg)*);
    };
}
pub(crate) use gc_log;

/// Aborts the process after a protocol violation. Phase dispatch reaching a phase it
/// does not understand is a programming error in the embedding, never a runtime
/// condition to recover from.
#[cold]
pub(crate) fn protocol_abort(what: &str) -> ! {
    eprintln!("rcimmix: {}", what);
    std::process::abort();
}

#[cold]
pub fn oom_abort() -> ! {
    eprintln!("rcimmix: OutOfMemory");
    std::process::abort();
}

/// Configuration for heap constructor.
pub struct Options {
    /// Block-space size cap. The large object space allocates until the system OOMs.
    pub heap_size: usize,
    /// Number of stop-the-world collector worker threads. Zero runs collections
    /// inline on the requesting thread.
    pub collector_threads: usize,
    /// Number of background workers draining the idle decrement buffer half between
    /// collections. Zero defers the backlog to the next cycle collection.
    pub concurrent_threads: usize,
    /// Perform a backup (cycle) trace every nth collection, in addition to explicit
    /// requests.
    pub cycle_collection_every: Option<usize>,
    /// Fraction of partially-free blocks above which a cycle collection also
    /// defragments.
    pub defrag_threshold: f64,
    /// Clean blocks reserved for the defrag copy allocator.
    pub defrag_headroom: usize,
    /// Enables verbose printing.
    pub verbose: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            heap_size: 32 * 1024 * 1024,
            collector_threads: 0,
            concurrent_threads: 0,
            cycle_collection_every: None,
            defrag_threshold: 0.9,
            defrag_headroom: 4,
            verbose: false,
        }
    }
}
