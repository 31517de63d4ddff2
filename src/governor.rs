//! Global accounting of concurrently queued workers.
//!
//! A single lock protects both the in-flight counters and the free list of
//! worker records, across every job running in the process. The caps keep
//! concurrent jobs from saturating the host: only 4/5 of the online CPUs
//! may run extra workers, system-wide and per affinity domain. The calling
//! thread of each job is never counted.

// unsafe code should be isolated to the thread pool
#![forbid(unsafe_code)]

use std::sync::Mutex;

use crate::topology::Topology;

/// Allow only this fraction of the CPUs to be running extra workers.
const CPUFRAC_NUMER: usize = 4;
const CPUFRAC_DENOM: usize = 5;

/// The system-wide cap on queued workers. Zero on a single-CPU host, which
/// disables parallel execution entirely.
pub(crate) fn total_cap(topology: &Topology) -> usize {
    let cpus = topology.online_cpus();
    if cpus <= 1 {
        return 0;
    }
    cpus * CPUFRAC_NUMER / CPUFRAC_DENOM
}

/// Per-node caps, indexed by node id. Nodes absent from the topology
/// (holes in the id space) get a cap of zero.
pub(crate) fn node_caps(topology: &Topology) -> Vec<usize> {
    let max_id = topology.nodes().iter().map(|n| n.id).max().unwrap_or(0);
    let mut caps = vec![0; max_id as usize + 1];
    for node in topology.nodes() {
        caps[node.id as usize] = node.cpus.len() * CPUFRAC_NUMER / CPUFRAC_DENOM;
    }
    caps
}

/// One reusable worker record. Records are allocated once, live on the
/// governor's free list between jobs, and are rewritten in place when a
/// worker migrates to a different affinity domain.
#[derive(Debug)]
pub(crate) struct WorkerRecord {
    /// Index into the job's node array where this worker starts claiming.
    pub start_node: usize,
    /// The affinity domain the work item is queued against. `None` lets it
    /// run anywhere.
    pub binding: Option<u32>,
}

#[derive(Debug)]
struct Accounting {
    total_cur: usize,
    node_cur: Vec<usize>,
    free: Vec<Box<WorkerRecord>>,
}

#[derive(Debug)]
pub(crate) struct Governor {
    state: Mutex<Accounting>,
    total_max: usize,
    node_max: Vec<usize>,
}

impl Governor {
    pub fn with_caps(total_max: usize, node_max: Vec<usize>) -> Self {
        let free = (0..total_max)
            .map(|_| {
                Box::new(WorkerRecord {
                    start_node: 0,
                    binding: None,
                })
            })
            .collect();

        Self {
            state: Mutex::new(Accounting {
                total_cur: 0,
                node_cur: vec![0; node_max.len()],
                free,
            }),
            total_max,
            node_max,
        }
    }

    /// Reserve one worker slot, preferring `preferred` as its affinity
    /// domain. The returned record is bound to that domain only if the
    /// domain's cap allows it; otherwise it is unbound. Returns `None`
    /// when the global cap is reached.
    pub fn try_reserve(&self, preferred: Option<u32>) -> Option<Box<WorkerRecord>> {
        let mut state = self.state.lock().unwrap();

        debug_assert!(state.total_cur <= self.total_max);
        if state.total_cur >= self.total_max {
            return None;
        }
        state.total_cur += 1;

        let mut record = state
            .free
            .pop()
            .expect("free list cannot be empty below the global cap");
        record.start_node = 0;
        record.binding =
            preferred.filter(|&nid| Self::bind(nid, &mut state.node_cur, &self.node_max));

        Some(record)
    }

    /// Return a record to the free list, dropping its counts.
    pub fn release(&self, record: Box<WorkerRecord>) {
        let mut state = self.state.lock().unwrap();

        if let Some(nid) = record.binding {
            debug_assert!(state.node_cur[nid as usize] > 0);
            state.node_cur[nid as usize] -= 1;
        }

        debug_assert!(state.total_cur > 0);
        state.total_cur -= 1;

        debug_assert!(state.free.len() < self.total_max);
        state.free.push(record);
    }

    /// Move a record's binding to the domain it is about to be re-queued
    /// on. The destination's cap governs: if the destination is full (or
    /// is no domain at all), the record ends up unbound.
    pub fn repin(&self, record: &mut WorkerRecord, to: Option<u32>) {
        let mut state = self.state.lock().unwrap();

        if let Some(old) = record.binding.take() {
            debug_assert!(state.node_cur[old as usize] > 0);
            state.node_cur[old as usize] -= 1;
        }

        record.binding = to.filter(|&nid| Self::bind(nid, &mut state.node_cur, &self.node_max));
    }

    /// Workers currently reserved across all jobs.
    #[cfg(test)]
    pub fn in_flight_total(&self) -> usize {
        self.state.lock().unwrap().total_cur
    }

    fn bind(nid: u32, node_cur: &mut [usize], node_max: &[usize]) -> bool {
        let nid = nid as usize;
        // a node id outside the topology never binds; the worker still runs
        if nid < node_max.len() && node_cur[nid] < node_max[nid] {
            node_cur[nid] += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_policy() {
        let topo = Topology::synthetic(&[4, 6]);
        assert_eq!(total_cap(&topo), 8);
        assert_eq!(node_caps(&topo), vec![3, 4]);
    }

    #[test]
    fn test_single_cpu_disables_reservations() {
        let topo = Topology::synthetic(&[1]);
        assert_eq!(total_cap(&topo), 0);

        let governor = Governor::with_caps(total_cap(&topo), node_caps(&topo));
        assert!(governor.try_reserve(None).is_none());
        assert!(governor.try_reserve(Some(0)).is_none());
    }

    #[test]
    fn test_reserve_to_global_cap() {
        let governor = Governor::with_caps(3, vec![3]);

        let records: Vec<_> = (0..3).map(|_| governor.try_reserve(None).unwrap()).collect();
        assert!(governor.try_reserve(None).is_none());
        assert_eq!(governor.in_flight_total(), 3);

        for record in records {
            governor.release(record);
        }
        assert_eq!(governor.in_flight_total(), 0);

        // the freed capacity is reusable
        let record = governor.try_reserve(None).unwrap();
        governor.release(record);
    }

    #[test]
    fn test_node_cap_falls_back_to_unbound() {
        let governor = Governor::with_caps(4, vec![2]);

        let a = governor.try_reserve(Some(0)).unwrap();
        let b = governor.try_reserve(Some(0)).unwrap();
        assert_eq!(a.binding, Some(0));
        assert_eq!(b.binding, Some(0));

        // node 0 is full; the global cap still has room
        let c = governor.try_reserve(Some(0)).unwrap();
        assert_eq!(c.binding, None);

        governor.release(a);
        let d = governor.try_reserve(Some(0)).unwrap();
        assert_eq!(d.binding, Some(0));

        governor.release(b);
        governor.release(c);
        governor.release(d);
    }

    #[test]
    fn test_repin_destination_cap_governs() {
        let governor = Governor::with_caps(4, vec![1, 1]);

        let mut a = governor.try_reserve(Some(0)).unwrap();
        let b = governor.try_reserve(Some(1)).unwrap();
        assert_eq!(a.binding, Some(0));
        assert_eq!(b.binding, Some(1));

        // node 1 is full, so the repinned record ends up unbound
        governor.repin(&mut a, Some(1));
        assert_eq!(a.binding, None);

        // node 0's slot was freed by the repin above
        let mut c = governor.try_reserve(Some(0)).unwrap();
        assert_eq!(c.binding, Some(0));

        // unbinding is also a valid destination
        governor.repin(&mut c, None);
        assert_eq!(c.binding, None);

        governor.release(a);
        governor.release(b);
        governor.release(c);
    }

    #[test]
    fn test_out_of_range_node_stays_unbound() {
        let governor = Governor::with_caps(2, vec![1]);
        let record = governor.try_reserve(Some(7)).unwrap();
        assert_eq!(record.binding, None);
        governor.release(record);
    }
}
