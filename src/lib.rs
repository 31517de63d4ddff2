//! Parallel decomposition of one large, CPU-bound job.
//!
//! A caller presents a workload as one or more [`Node`]s (a cursor, a
//! length, and the affinity domain holding that span's memory) plus a
//! processing callback, and blocks until the whole workload has been
//! processed. The decomposer splits the workload into chunks, runs the
//! callback on chunks from several worker threads at once, and steers each
//! worker towards the domain whose memory it is touching.
//!
//! Parallelism is capped process-wide: across all jobs running at the same
//! time, at most 4/5 of the online CPUs (counted system-wide and per
//! domain) may be running extra workers, so concurrent decompositions
//! can't saturate the host. The calling thread always participates as one
//! of the workers, so a job makes progress even when the caps are fully
//! claimed by other jobs; it just runs with less parallelism, down to
//! plain serial execution on the calling thread.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let processed = AtomicUsize::new(0);
//! let process = |start: usize, end: usize| -> Result<(), ()> {
//!     // the heavy work would go here; no lock is held
//!     processed.fetch_add(end - start, Ordering::Relaxed);
//!     Ok(())
//! };
//!
//! let ctl = partask::Ctl::new(&process)
//!     .with_min_chunk_size(4096)
//!     .with_max_threads(8);
//! partask::run(0usize, 1 << 20, &ctl).unwrap();
//!
//! assert_eq!(processed.load(Ordering::Relaxed), 1 << 20);
//! ```
//!
//! The first `Err` returned by any processing call is latched and returned
//! from the run; once it is observed no further chunks are claimed, but
//! chunks already being processed are drained, not cancelled. The
//! processing callback must terminate, and must not panic: a panicking
//! callback takes its pool thread down with it (the job itself still
//! completes and the caller still unblocks).

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

mod chunk;
mod governor;
mod pools;
mod sync;
mod task;
mod topology;

pub use task::{run, run_numa, set_default_max_threads, Ctl, Node};

/// A position in the caller's workload.
///
/// The decomposer never inspects a cursor; it only advances it by claimed
/// chunk sizes and hands the resulting `[start, end)` pair to the
/// processing callback. The provided `usize` and `u64` impls treat the
/// cursor as a byte offset, which fits linear buffers; implement the trait
/// yourself for anything fancier (strided layouts, opaque handles, ...).
pub trait Cursor: Copy + Send {
    /// Advance the cursor by `count` work units.
    ///
    /// Called with the job lock held, so this must stay O(1) and must not
    /// block: offset arithmetic, nothing more.
    fn advance(self, count: usize) -> Self;
}

impl Cursor for usize {
    fn advance(self, count: usize) -> Self {
        self + count
    }
}

impl Cursor for u64 {
    fn advance(self, count: usize) -> Self {
        self + count as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_offset_cursors() {
        assert_eq!(Cursor::advance(0usize, 4096), 4096);
        assert_eq!(Cursor::advance(0x10000u64, 512), 0x10200);
    }
}
