//! Infrastructure adapters: host accounts, snapshots, topology, cgroups.

pub mod cgroup;
pub mod memory;
pub mod passwd;
pub mod snapshot;
pub mod topology;

pub use cgroup::{CgroupFs, CpusetSink};
pub use memory::{HostCall, InMemoryHost};
pub use passwd::PasswdProbe;
pub use snapshot::SnapshotStore;
pub use topology::{FlatTopology, SysfsTopology, Topology, TopologySource};
