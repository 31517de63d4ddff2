//! CPU and NUMA topology queries.
//!
//! The affinity-domain layout is read once from sysfs at process start and
//! drives the worker caps and the per-node thread pools. Hosts without a
//! NUMA sysfs tree (or without NUMA at all) collapse to a single domain
//! holding every online CPU.

use std::path::Path;

/// One online affinity domain and the CPUs it contains.
#[derive(Debug, Clone)]
pub(crate) struct NodeTopo {
    pub id: u32,
    /// CPU ids local to this node. Empty for memory-only nodes.
    pub cpus: Vec<u32>,
}

#[derive(Debug, Clone)]
pub(crate) struct Topology {
    nodes: Vec<NodeTopo>,
    online_cpus: usize,
    /// Whether worker threads should be pinned to their node's CPU set.
    pin_workers: bool,
}

impl Topology {
    /// Read the live topology. Falls back to a single domain spanning all
    /// online CPUs when the NUMA sysfs tree is unavailable.
    pub fn detect() -> Self {
        // available_parallelism respects the process affinity mask, which
        // matters on cpuset-restricted hosts.
        let online_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let nodes = read_sysfs_nodes(Path::new("/sys/devices/system/node")).unwrap_or_else(|| {
            vec![NodeTopo {
                id: 0,
                cpus: (0..online_cpus as u32).collect(),
            }]
        });

        Self {
            nodes,
            online_cpus,
            pin_workers: true,
        }
    }

    /// A synthetic topology for tests: one node per entry, holding the
    /// given number of CPUs. Workers are never pinned, so this is safe to
    /// use on any host.
    #[cfg(test)]
    pub fn synthetic(cpus_per_node: &[usize]) -> Self {
        let mut next_cpu = 0u32;
        let nodes = cpus_per_node
            .iter()
            .enumerate()
            .map(|(id, &ncpus)| {
                let cpus = (next_cpu..next_cpu + ncpus as u32).collect();
                next_cpu += ncpus as u32;
                NodeTopo { id: id as u32, cpus }
            })
            .collect();

        Self {
            nodes,
            online_cpus: cpus_per_node.iter().sum::<usize>().max(1),
            pin_workers: false,
        }
    }

    pub fn online_cpus(&self) -> usize {
        self.online_cpus
    }

    pub fn nr_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[NodeTopo] {
        &self.nodes
    }

    pub fn pin_workers(&self) -> bool {
        self.pin_workers
    }

    pub fn node_of_cpu(&self, cpu: u32) -> Option<u32> {
        self.nodes
            .iter()
            .find(|n| n.cpus.contains(&cpu))
            .map(|n| n.id)
    }

    /// The affinity domain of the CPU the calling thread is running on.
    pub fn current_node(&self) -> Option<u32> {
        // SAFETY: sched_getcpu takes no pointers and only returns a cpu
        // number or -1.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu < 0 {
            return None;
        }
        self.node_of_cpu(cpu as u32)
    }
}

fn read_sysfs_nodes(root: &Path) -> Option<Vec<NodeTopo>> {
    let online = std::fs::read_to_string(root.join("online")).ok()?;
    let ids = parse_cpu_list(online.trim())?;

    let mut nodes = Vec::with_capacity(ids.len());
    for id in ids {
        let cpulist = std::fs::read_to_string(root.join(format!("node{id}/cpulist"))).ok()?;
        let cpus = parse_cpu_list(cpulist.trim())?;
        nodes.push(NodeTopo { id, cpus });
    }

    (!nodes.is_empty()).then_some(nodes)
}

/// Parse the kernel's cpu list format, e.g. "0-3,8,10-11". An empty string
/// is an empty list (memory-only nodes have an empty cpulist).
fn parse_cpu_list(s: &str) -> Option<Vec<u32>> {
    let mut out = Vec::new();

    if s.is_empty() {
        return Some(out);
    }

    for part in s.split(',') {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = lo.trim().parse().ok()?;
                let hi: u32 = hi.trim().parse().ok()?;
                if lo > hi {
                    return None;
                }
                out.extend(lo..=hi);
            }
            None => out.push(part.trim().parse().ok()?),
        }
    }

    Some(out)
}
