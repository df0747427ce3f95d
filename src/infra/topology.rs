//! CPU and memory-node topology sources.
//!
//! [`SysfsTopology`] reads the cpuset root and the sysfs CPU/NUMA trees;
//! [`FlatTopology`] describes a host with one memory node and no SMT
//! siblings, sized by `num_cpus`.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::coresched::parse_cpu_list;
use crate::core::CoreSchedError;

/// Default cpuset controller root.
pub const DEFAULT_CPUSET_ROOT: &str = "/sys/fs/cgroup/cpuset";
/// Default sysfs CPU directory.
pub const DEFAULT_CPU_SYSFS_ROOT: &str = "/sys/devices/system/cpu";
/// Default sysfs NUMA node directory.
pub const DEFAULT_NODE_SYSFS_ROOT: &str = "/sys/devices/system/node";

/// Allocatable CPUs and memory nodes of a host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    /// Allocatable CPU ids, ascending.
    pub cpus: Vec<u32>,
    /// Hardware-thread siblings of each CPU (including itself).
    pub siblings: BTreeMap<u32, Vec<u32>>,
    /// Allocatable memory node ids, ascending.
    pub mems: Vec<u32>,
    /// CPUs local to each memory node.
    pub mem_cpus: BTreeMap<u32, Vec<u32>>,
}

impl Topology {
    /// One memory node, `n` CPUs, no shared siblings.
    #[must_use]
    pub fn flat(n: u32) -> Self {
        let cpus: Vec<u32> = (0..n).collect();
        Self {
            siblings: cpus.iter().map(|c| (*c, vec![*c])).collect(),
            mems: vec![0],
            mem_cpus: BTreeMap::from([(0, cpus.clone())]),
            cpus,
        }
    }

    /// Siblings of `cpu`; empty when unknown.
    #[must_use]
    pub fn siblings_of(&self, cpu: u32) -> &[u32] {
        self.siblings.get(&cpu).map(Vec::as_slice).unwrap_or_default()
    }

    /// CPUs of memory node `mem`; empty when unknown.
    #[must_use]
    pub fn cpus_of_mem(&self, mem: u32) -> &[u32] {
        self.mem_cpus.get(&mem).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether there is nothing to allocate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }
}

/// Pluggable topology discovery.
pub trait TopologySource: Send + Sync {
    /// Discover the current topology.
    ///
    /// # Errors
    ///
    /// Implementations fail only when the topology cannot be read at all;
    /// individual units that are missing are left out instead.
    fn discover(&self) -> Result<Topology, CoreSchedError>;
}

impl<T: TopologySource + ?Sized> TopologySource for Box<T> {
    fn discover(&self) -> Result<Topology, CoreSchedError> {
        (**self).discover()
    }
}

/// Topology read from a cpuset root and the sysfs CPU/node trees.
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    cpuset_root: PathBuf,
    cpu_root: PathBuf,
    node_root: PathBuf,
}

impl SysfsTopology {
    /// Source over explicit roots.
    pub fn new(
        cpuset_root: impl AsRef<Path>,
        cpu_root: impl AsRef<Path>,
        node_root: impl AsRef<Path>,
    ) -> Self {
        Self {
            cpuset_root: cpuset_root.as_ref().to_path_buf(),
            cpu_root: cpu_root.as_ref().to_path_buf(),
            node_root: node_root.as_ref().to_path_buf(),
        }
    }
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new(DEFAULT_CPUSET_ROOT, DEFAULT_CPU_SYSFS_ROOT, DEFAULT_NODE_SYSFS_ROOT)
    }
}

impl TopologySource for SysfsTopology {
    fn discover(&self) -> Result<Topology, CoreSchedError> {
        let Some(all_cpus) = read_list(&self.cpuset_root.join("cpuset.cpus"))? else {
            warn!(root = %self.cpuset_root.display(), "no cpuset.cpus, no cpus to allocate");
            return Ok(Topology::default());
        };

        let mut topology = Topology::default();
        for cpu in all_cpus {
            let path = self
                .cpu_root
                .join(format!("cpu{cpu}"))
                .join("topology")
                .join("thread_siblings_list");
            match read_list(&path) {
                Ok(Some(siblings)) => {
                    topology.cpus.push(cpu);
                    topology.siblings.insert(cpu, siblings);
                }
                Ok(None) => debug!(cpu, "cpu topology missing, cpu left out"),
                Err(e) => warn!(cpu, error = %e, "cpu topology unreadable, cpu left out"),
            }
        }

        let all_mems = read_list(&self.cpuset_root.join("cpuset.mems"))?.unwrap_or_default();
        for mem in all_mems {
            let path = self.node_root.join(format!("node{mem}")).join("cpulist");
            match read_list(&path) {
                Ok(Some(cpus)) => {
                    topology.mems.push(mem);
                    topology.mem_cpus.insert(mem, cpus);
                }
                Ok(None) => debug!(mem, "memory node topology missing, node left out"),
                Err(e) => warn!(mem, error = %e, "memory node topology unreadable, node left out"),
            }
        }

        topology.cpus.sort_unstable();
        topology.mems.sort_unstable();
        debug!(cpus = topology.cpus.len(), mems = topology.mems.len(), "topology discovered");
        Ok(topology)
    }
}

/// Flat topology sized from the host's logical CPU count.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatTopology {
    cpus: Option<u32>,
}

impl FlatTopology {
    /// Use the detected logical CPU count.
    #[must_use]
    pub const fn detected() -> Self {
        Self { cpus: None }
    }

    /// Use a fixed CPU count.
    #[must_use]
    pub const fn with_cpus(cpus: u32) -> Self {
        Self { cpus: Some(cpus) }
    }
}

impl TopologySource for FlatTopology {
    fn discover(&self) -> Result<Topology, CoreSchedError> {
        let n = self
            .cpus
            .unwrap_or_else(|| u32::try_from(num_cpus::get()).unwrap_or(u32::MAX));
        Ok(Topology::flat(n))
    }
}

/// Read a cpu/node list file. `Ok(None)` if the file does not exist.
fn read_list(path: &Path) -> Result<Option<Vec<u32>>, CoreSchedError> {
    match fs::read_to_string(path) {
        Ok(text) => parse_cpu_list(&text).map(Some),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CoreSchedError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}
