//! Channel-fed worker pools with optional node affinity.
//!
//! One group of threads per affinity domain, pinned to that domain's CPU
//! set, plus one unpinned group for work with no affinity preference. Work
//! items are queued to a group and run exactly once on some thread of that
//! group; there is no ordering between items. The threads are started once
//! at pool construction and park in a channel receive when idle.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::channel::{Receiver, Sender};

use crate::topology::Topology;

/// A work item queued to the pool. Runs exactly once on some pool thread.
pub(crate) type WorkItem = Box<dyn FnOnce() + Send>;

struct NodeGroup {
    node_id: u32,
    sender: Sender<WorkItem>,
}

pub(crate) struct DispatchPool {
    groups: Vec<NodeGroup>,
    /// Unpinned threads. `None` if they failed to spawn; dispatch then
    /// falls back to the node groups.
    any_sender: Option<Sender<WorkItem>>,
    handles: Vec<std::thread::JoinHandle<()>>,
    next_group: AtomicUsize,
}

impl DispatchPool {
    /// Start `node_caps[n]` threads pinned to each node `n` and
    /// `total_cap` unpinned threads. Spawn failures degrade the pool
    /// rather than failing construction.
    pub fn new(topology: &Topology, node_caps: &[usize], total_cap: usize) -> Self {
        let mut handles = Vec::new();
        let mut groups = Vec::new();

        for node in topology.nodes() {
            let nthreads = node_caps.get(node.id as usize).copied().unwrap_or(0);
            if nthreads == 0 {
                continue;
            }

            let (sender, receiver) = crossbeam::channel::unbounded();
            let mut spawned = 0;
            for _ in 0..nthreads {
                let receiver = receiver.clone();
                let cpus = if topology.pin_workers() {
                    node.cpus.clone()
                } else {
                    Vec::new()
                };
                let spawn = std::thread::Builder::new()
                    .name(format!("partask-node{}", node.id))
                    .spawn(move || work_loop(receiver, cpus));
                match spawn {
                    Ok(handle) => {
                        handles.push(handle);
                        spawned += 1;
                    }
                    Err(err) => {
                        log::warn!("failed to spawn a worker for node {}: {err}", node.id);
                        break;
                    }
                }
            }

            if spawned > 0 {
                groups.push(NodeGroup {
                    node_id: node.id,
                    sender,
                });
            }
        }

        let mut any_sender = None;
        if total_cap > 0 {
            let (sender, receiver) = crossbeam::channel::unbounded();
            let mut spawned = 0;
            for _ in 0..total_cap {
                let receiver = receiver.clone();
                let spawn = std::thread::Builder::new()
                    .name("partask-any".to_string())
                    .spawn(move || work_loop(receiver, Vec::new()));
                match spawn {
                    Ok(handle) => {
                        handles.push(handle);
                        spawned += 1;
                    }
                    Err(err) => {
                        log::warn!("failed to spawn an unpinned worker: {err}");
                        break;
                    }
                }
            }
            if spawned > 0 {
                any_sender = Some(sender);
            }
        }

        Self {
            groups,
            any_sender,
            handles,
            next_group: AtomicUsize::new(0),
        }
    }

    /// Whether at least one thread is accepting work.
    pub fn has_workers(&self) -> bool {
        !self.groups.is_empty() || self.any_sender.is_some()
    }

    /// Queue a work item, preferring a thread pinned to `node`. Unknown
    /// nodes and `None` go to the unpinned group.
    pub fn dispatch(&self, node: Option<u32>, work: WorkItem) {
        debug_assert!(self.has_workers());

        let sender = match node {
            Some(nid) => self
                .groups
                .iter()
                .find(|g| g.node_id == nid)
                .map(|g| &g.sender)
                .or(self.any_sender.as_ref()),
            None => self.any_sender.as_ref(),
        };
        let sender = sender.unwrap_or_else(|| {
            // no unpinned threads; spread over the node groups instead
            let next = self.next_group.fetch_add(1, Ordering::Relaxed);
            &self.groups[next % self.groups.len()].sender
        });

        if let Err(returned) = sender.send(work) {
            // All receivers are gone, which only happens when every thread
            // of the group has died. Run the item here rather than lose it;
            // the job still completes, just without this worker.
            log::warn!("pool threads have exited; running a work item inline");
            (returned.0)();
        }
    }

    /// Queue a work item whose captures live only for `'scope`.
    ///
    /// # Safety
    ///
    /// The caller must not leave `'scope` until the work item has finished
    /// running. The job's completion latch provides exactly that: the
    /// latch opens only after every dispatched worker has returned, and
    /// the dispatching frame blocks on it before unwinding or returning.
    pub unsafe fn dispatch_scoped<'scope>(
        &self,
        node: Option<u32>,
        work: Box<dyn FnOnce() + Send + 'scope>,
    ) {
        // SAFETY: per this function's contract the item is run (and
        // dropped) before 'scope ends.
        let work = unsafe {
            std::mem::transmute::<Box<dyn FnOnce() + Send + 'scope>, WorkItem>(work)
        };
        self.dispatch(node, work);
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        // closing the channels makes the threads fall out of their loops
        self.groups.clear();
        self.any_sender = None;

        for handle in self.handles.drain(..) {
            handle.join().expect("a pool thread panicked");
        }
    }
}

fn work_loop(receiver: Receiver<WorkItem>, cpus: Vec<u32>) {
    if !cpus.is_empty() {
        pin_to(&cpus);
    }

    // the channel disconnects when the pool is dropped
    while let Ok(work) = receiver.recv() {
        work();
    }
}

/// Pin the calling thread to a CPU set. Best-effort: on hosts where the
/// mask is rejected (cpuset restrictions), the thread runs unpinned.
fn pin_to(cpus: &[u32]) {
    let mut set = nix::sched::CpuSet::new();
    for &cpu in cpus {
        if set.set(cpu as usize).is_err() {
            log::warn!("cpu {cpu} does not fit in the affinity mask");
            return;
        }
    }

    if let Err(err) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &set) {
        log::warn!("failed to pin a worker thread: {err}");
    }
}
