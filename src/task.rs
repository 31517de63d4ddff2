//! Job state, the worker loop, and the public entry points.
//!
//! A job splits its workload into chunks sized by [`crate::chunk`] and lets
//! every worker (the calling thread plus any extra workers granted by the
//! governor) claim chunks from a shared remaining-work ledger. Claims are
//! cheap and happen under the job lock; the caller's processing callback
//! runs with the lock released, so the heavy work proceeds in parallel.
//! When a worker drains its node it picks a random node that still has
//! work, possibly migrating itself to that node's affinity domain.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use rand::Rng;

use crate::chunk;
use crate::governor::{self, Governor, WorkerRecord};
use crate::pools::node_aware::DispatchPool;
use crate::sync::completion::Completion;
use crate::topology::Topology;
use crate::Cursor;

const DEFAULT_MAX_THREADS: usize = 4;

/// Process-wide scheduling state: topology, caps, and the worker pools.
/// Built once, on first use.
pub(crate) struct Runtime {
    topology: Topology,
    governor: Governor,
    pool: DispatchPool,
    default_max_threads: AtomicUsize,
}

static RUNTIME: Lazy<Runtime> = Lazy::new(|| Runtime::new(Topology::detect()));

impl Runtime {
    pub(crate) fn new(topology: Topology) -> Self {
        let mut total = governor::total_cap(&topology);
        let per_node = governor::node_caps(&topology);

        let pool = DispatchPool::new(&topology, &per_node, total);
        if total > 0 && !pool.has_workers() {
            log::warn!("no pool threads could be started; jobs will run serially");
            total = 0;
        }

        Self {
            topology,
            governor: Governor::with_caps(total, per_node),
            pool,
            default_max_threads: AtomicUsize::new(DEFAULT_MAX_THREADS),
        }
    }
}

/// Set the process-wide cap on workers per job, used by jobs that don't
/// set [`Ctl::with_max_threads`]. The initial default is 4.
pub fn set_default_max_threads(max: usize) {
    RUNTIME.default_max_threads.store(max.max(1), Ordering::Relaxed);
}

/// One contiguous span of work living on a single affinity domain.
#[derive(Debug, Clone, Copy)]
pub struct Node<C> {
    /// Where the span starts. Opaque to the decomposer; only
    /// [`Cursor::advance`] gives it meaning.
    pub start: C,
    /// Work units in the span.
    pub len: usize,
    /// The affinity domain holding the span's memory, or `None` for no
    /// preference.
    pub numa_node: Option<u32>,
}

impl<C> Node<C> {
    pub fn new(start: C, len: usize, numa_node: Option<u32>) -> Self {
        Self {
            start,
            len,
            numa_node,
        }
    }
}

/// Per-job options and callbacks.
pub struct Ctl<'a, C, E> {
    process: &'a (dyn Fn(C, C) -> Result<(), E> + Sync),
    min_chunk_size: usize,
    max_threads: usize,
}

impl<'a, C, E> Ctl<'a, C, E> {
    /// A new control block around the processing callback. The callback is
    /// handed a half-open `[start, end)` range and runs with no lock held;
    /// it is the heavy work. Any state it needs comes in via its captures.
    pub fn new(process: &'a (impl Fn(C, C) -> Result<(), E> + Sync)) -> Self {
        Self {
            process,
            min_chunk_size: 1,
            max_threads: 0,
        }
    }

    /// The smallest claim a worker may take, for callers that operate in
    /// fixed-size batches (e.g. whole pages). Zero is treated as 1.
    pub fn with_min_chunk_size(mut self, size: usize) -> Self {
        self.min_chunk_size = size.max(1);
        self
    }

    /// Cap the number of workers for this job. Zero selects the
    /// process-wide default (see [`set_default_max_threads`]).
    pub fn with_max_threads(mut self, max: usize) -> Self {
        self.max_threads = max;
        self
    }
}

/// Run `len` units of work starting at `start` on the calling thread's
/// affinity domain, blocking until the whole workload is processed.
/// Returns the first error any processing call reported.
pub fn run<C: Cursor, E: Send>(start: C, len: usize, ctl: &Ctl<'_, C, E>) -> Result<(), E> {
    let rt = &*RUNTIME;
    let node = Node::new(start, len, rt.topology.current_node());
    run_numa_in(rt, &[node], ctl)
}

/// Run a workload spread across one or more affinity domains, blocking
/// until every span is processed. Returns the first error any processing
/// call reported; capacity pressure and single-CPU hosts never fail the
/// call, they only reduce parallelism (down to the calling thread alone).
pub fn run_numa<C: Cursor, E: Send>(nodes: &[Node<C>], ctl: &Ctl<'_, C, E>) -> Result<(), E> {
    run_numa_in(&RUNTIME, nodes, ctl)
}

struct NodeState<C> {
    start: C,
    remaining: usize,
    numa_node: Option<u32>,
}

struct JobInner<C, E> {
    nodes: Vec<NodeState<C>>,
    total_remaining: usize,
    /// Count of nodes with `remaining > 0`. Zero iff `total_remaining` is.
    nodes_left: usize,
    nworks: usize,
    nworks_fini: usize,
    /// First error reported by a processing call. Write-once.
    error: Option<E>,
}

struct Job<'a, C, E> {
    rt: &'a Runtime,
    ctl: &'a Ctl<'a, C, E>,
    /// Fixed once nworks is known, before any worker runs.
    chunk_size: usize,
    inner: Mutex<JobInner<C, E>>,
    done: Completion,
}

fn run_numa_in<C: Cursor, E: Send>(
    rt: &Runtime,
    nodes: &[Node<C>],
    ctl: &Ctl<'_, C, E>,
) -> Result<(), E> {
    let states: Vec<NodeState<C>> = nodes
        .iter()
        .map(|n| NodeState {
            start: n.start,
            remaining: n.len,
            numa_node: n.numa_node,
        })
        .collect();
    let total: usize = states.iter().map(|n| n.remaining).sum();

    if total == 0 {
        return Ok(());
    }
    let nodes_left = states.iter().filter(|n| n.remaining > 0).count();

    let records = reserve_workers(rt, nodes, total, ctl);
    let nworks = records.len() + 1;

    let job = Job {
        rt,
        ctl,
        chunk_size: chunk::chunk_size(total, ctl.min_chunk_size, nworks),
        inner: Mutex::new(JobInner {
            nodes: states,
            total_remaining: total,
            nodes_left,
            nworks,
            nworks_fini: 0,
            error: None,
        }),
        done: Completion::new(),
    };

    log::debug!(
        "job: total={} chunk={} workers={} nodes={}",
        total,
        job.chunk_size,
        nworks,
        nodes.len()
    );

    // The dispatched work items borrow `job`, so this frame must block for
    // all of them before it unwinds, even if a worker panics below.
    let wait = WaitOnDrop { job: &job };

    for record in records {
        let binding = record.binding;
        let job = &job;
        // SAFETY: `wait` blocks this frame until the work item, and any
        // continuation it migrates to, has finished.
        unsafe {
            rt.pool
                .dispatch_scoped(binding, Box::new(move || worker_thread(job, Some(record))));
        }
    }

    // the calling thread always participates, saving one dispatch
    worker_thread(&job, None);

    drop(wait);

    let inner = job.inner.into_inner().unwrap();
    debug_assert_eq!(inner.nworks_fini, inner.nworks);
    match inner.error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Reserve up to `wanted - 1` extra workers, spreading their starting
/// nodes round-robin over the job's node array and asking the governor to
/// bind each to its starting node's domain. Stops early at the global cap.
fn reserve_workers<C, E>(
    rt: &Runtime,
    nodes: &[Node<C>],
    total: usize,
    ctl: &Ctl<'_, C, E>,
) -> Vec<Box<WorkerRecord>> {
    let mut max_threads = ctl.max_threads;
    if max_threads == 0 {
        max_threads = rt.default_max_threads.load(Ordering::Relaxed);
    }

    let wanted = total
        .div_ceil(ctl.min_chunk_size)
        .min(rt.topology.online_cpus())
        .min(max_threads);

    let mut records = Vec::new();
    for i in 1..wanted {
        let start_node = i % nodes.len();
        match rt.governor.try_reserve(nodes[start_node].numa_node) {
            Some(mut record) => {
                record.start_node = start_node;
                records.push(record);
            }
            // the global cap is taken by other jobs; run with what we have
            None => break,
        }
    }
    records
}

fn worker_thread<C: Cursor, E: Send>(job: &Job<'_, C, E>, record: Option<Box<WorkerRecord>>) {
    let pooled = record.is_some();
    let mut node_idx = record.as_ref().map_or(0, |r| r.start_node);

    // Completion must be recorded exactly once per worker even if the
    // processing callback panics, or the caller would wait forever.
    let mut guard = FinishOnDrop { job, record };

    let mut rng = rand::thread_rng();
    let mut inner = job.inner.lock().unwrap();

    while inner.total_remaining > 0 && inner.error.is_none() {
        if inner.nodes[node_idx].remaining == 0 {
            // This node is drained; pick a random node that isn't. The
            // random choice keeps workers from converging on one victim.
            debug_assert!(inner.nodes_left > 0);
            let r = rng.gen_range(0..inner.nodes_left);
            let old_idx = node_idx;
            node_idx = inner
                .nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.remaining > 0)
                .nth(r)
                .map(|(i, _)| i)
                .expect("nodes_left tracks nodes with remaining work");

            if pooled
                && job.rt.topology.nr_nodes() > 1
                && inner.nodes[node_idx].numa_node != inner.nodes[old_idx].numa_node
            {
                // Hand our identity to a fresh work item on the new node's
                // domain and bow out. The continuation inherits the
                // reservation, so completion accounting is untouched.
                let to = inner.nodes[node_idx].numa_node;
                let mut record = guard.record.take().expect("only pooled workers migrate");
                std::mem::forget(guard);
                drop(inner);

                job.rt.governor.repin(&mut record, to);
                record.start_node = node_idx;
                let binding = record.binding;
                log::trace!("worker migrating to node index {node_idx} ({to:?})");
                // SAFETY: the continuation finishes before the job's
                // completion latch opens, and the dispatching frame blocks
                // on that latch.
                unsafe {
                    job.rt
                        .pool
                        .dispatch_scoped(binding, Box::new(move || worker_thread(job, Some(record))));
                }
                return;
            }
        }

        let size = job.chunk_size.min(inner.nodes[node_idx].remaining);
        let node = &mut inner.nodes[node_idx];
        let start = node.start;
        // cursor arithmetic only; cheap enough to do under the lock
        let end = start.advance(size);
        node.start = end;
        node.remaining -= size;

        debug_assert!(inner.total_remaining >= size);
        inner.total_remaining -= size;
        if inner.nodes[node_idx].remaining == 0 {
            debug_assert!(inner.nodes_left > 0);
            inner.nodes_left -= 1;
        }

        drop(inner);

        // the heavy callback runs with no lock held
        let result = (job.ctl.process)(start, end);

        inner = job.inner.lock().unwrap();
        if inner.error.is_none() {
            if let Err(err) = result {
                // first error only; later ones are discarded
                inner.error = Some(err);
            }
        }
    }

    debug_assert!(inner.nodes_left == 0 || inner.error.is_some());
    drop(inner);
    // `guard` drops here: release the reservation, count this worker done
}

struct FinishOnDrop<'a, 'b, C, E> {
    job: &'a Job<'b, C, E>,
    record: Option<Box<WorkerRecord>>,
}

impl<C, E> Drop for FinishOnDrop<'_, '_, C, E> {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            self.job.rt.governor.release(record);
        }

        let done = {
            let mut inner = self.job.inner.lock().unwrap();
            inner.nworks_fini += 1;
            debug_assert!(inner.nworks_fini <= inner.nworks);
            inner.nworks_fini == inner.nworks
        };

        // nothing may touch the job after the latch opens
        if done {
            self.job.done.complete();
        }
    }
}

struct WaitOnDrop<'a, 'b, C, E> {
    job: &'a Job<'b, C, E>,
}

impl<C, E> Drop for WaitOnDrop<'_, '_, C, E> {
    fn drop(&mut self) {
        self.job.done.wait();
    }
}
