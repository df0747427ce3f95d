//! NUMA-aware dedicated-core allocation.
//!
//! Slivers ask for a number of dedicated CPUs through an rspec attribute
//! (`cpu_cores`, optionally suffixed `b` for best-effort). CPUs are handed out
//! greedily, preferring hardware siblings of the previous pick, and each pick
//! is paired with a local memory node when one is free. Whatever is left forms
//! the default pool shared by everybody else.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::core::{CoreSchedError, Record, ResourceValue};
use crate::infra::cgroup::CpusetSink;
use crate::infra::topology::{Topology, TopologySource};

/// Rspec attribute carrying the core request.
pub const DEFAULT_CORE_ATTRIBUTE: &str = "cpu_cores";

/// A parsed core request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreRequest {
    /// Dedicated CPUs wanted.
    pub cores: u32,
    /// Also run on the default pool.
    pub best_effort: bool,
}

impl CoreRequest {
    /// Parse an rspec value. Missing or malformed values request nothing.
    #[must_use]
    pub fn parse(value: Option<&ResourceValue>) -> Self {
        match value {
            None => Self::default(),
            Some(ResourceValue::Amount(n)) => Self {
                cores: u32::try_from(*n).unwrap_or(0),
                best_effort: false,
            },
            Some(ResourceValue::Text(s)) => Self::parse_str(s),
        }
    }

    /// Parse `"N"` or `"Nb"`.
    #[must_use]
    pub fn parse_str(text: &str) -> Self {
        let text = text.trim();
        let (digits, best_effort) = text
            .strip_suffix('b')
            .map_or((text, false), |d| (d, true));
        match digits.trim().parse::<u32>() {
            Ok(cores) => Self { cores, best_effort },
            Err(_) => {
                debug!(request = text, "malformed core request treated as zero");
                Self::default()
            }
        }
    }
}

/// CPUs and memory nodes assigned to one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TenantCores {
    /// CPUs reserved for this tenant alone.
    pub dedicated_cpus: Vec<u32>,
    /// Memory nodes paired with the dedicated CPUs.
    pub dedicated_mems: Vec<u32>,
    /// CPUs the tenant's group is written with.
    pub cpus: Vec<u32>,
    /// Memory nodes the tenant's group is written with (empty means the
    /// unreserved nodes, or all nodes when none are unreserved).
    pub mems: Vec<u32>,
    /// Whether the default pool was appended.
    pub best_effort: bool,
}

/// Result of one allocation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreAllocation {
    /// CPUs nobody reserved.
    pub default_cpus: Vec<u32>,
    /// Memory nodes nobody reserved.
    pub default_mems: Vec<u32>,
    /// Per-tenant assignment.
    pub tenants: BTreeMap<String, TenantCores>,
}

impl CoreAllocation {
    /// CPUs to write for `group`: its assignment, or the default pool.
    #[must_use]
    pub fn cpus_for(&self, group: &str) -> &[u32] {
        self.tenants
            .get(group)
            .map_or(self.default_cpus.as_slice(), |t| t.cpus.as_slice())
    }

    /// Memory nodes to write for `group`: its assignment, or the default pool.
    #[must_use]
    pub fn mems_for(&self, group: &str) -> &[u32] {
        self.tenants
            .get(group)
            .map_or(self.default_mems.as_slice(), |t| t.mems.as_slice())
    }
}

/// Outcome of [`CoreSched::adjust_cores`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreSchedReport {
    /// The computed allocation.
    pub allocation: CoreAllocation,
    /// Whether the node-wide default files were written.
    pub default_written: bool,
    /// Groups written successfully.
    pub written_groups: Vec<String>,
    /// Groups whose write failed.
    pub failed_groups: Vec<String>,
}

/// Allocate dedicated CPUs to `requests`, in order.
///
/// At least one CPU always stays in the default pool. The dedicated sets
/// together with the default pool partition `topology.cpus`.
pub fn allocate(topology: &Topology, requests: &[(String, CoreRequest)]) -> CoreAllocation {
    let mut free_cpus = topology.cpus.clone();
    let mut free_mems = topology.mems.clone();
    let mut reserved: Vec<(&str, Vec<u32>, Vec<u32>, bool)> = Vec::with_capacity(requests.len());

    for (name, request) in requests {
        let mut cpus = Vec::new();
        let mut mems = Vec::new();
        let mut previous = None;

        for _ in 0..request.cores {
            if free_cpus.len() <= 1 {
                warn!(
                    tenant = %name,
                    requested = request.cores,
                    granted = cpus.len(),
                    "ran out of cpus, request under-served"
                );
                break;
            }
            let Some(cpu) = pick_cpu(topology, &free_cpus, previous) else {
                break;
            };
            free_cpus.retain(|c| *c != cpu);
            cpus.push(cpu);
            previous = Some(cpu);

            match free_mems
                .iter()
                .position(|m| topology.cpus_of_mem(*m).contains(&cpu))
            {
                Some(idx) => mems.push(free_mems.remove(idx)),
                None => debug!(tenant = %name, cpu, "no free memory node local to cpu"),
            }
        }

        reserved.push((name.as_str(), cpus, mems, request.best_effort));
    }

    let mut tenants = BTreeMap::new();
    for (name, dedicated_cpus, dedicated_mems, best_effort) in reserved {
        let mut cpus = dedicated_cpus.clone();
        let mut mems = dedicated_mems.clone();
        let shares_default = cpus.is_empty() || best_effort;
        if shares_default {
            cpus.extend_from_slice(&free_cpus);
            mems.extend_from_slice(&free_mems);
            cpus.sort_unstable();
            cpus.dedup();
            mems.sort_unstable();
            mems.dedup();
        }
        tenants.insert(
            name.to_owned(),
            TenantCores {
                dedicated_cpus,
                dedicated_mems,
                cpus,
                mems,
                best_effort,
            },
        );
    }

    CoreAllocation {
        default_cpus: free_cpus,
        default_mems: free_mems,
        tenants,
    }
}

/// Next CPU: a free sibling of `previous`, else the free CPU with the most
/// free siblings (lowest id on ties).
fn pick_cpu(topology: &Topology, free: &[u32], previous: Option<u32>) -> Option<u32> {
    if let Some(prev) = previous {
        let siblings = topology.siblings_of(prev);
        if let Some(&cpu) = free.iter().find(|c| siblings.contains(*c)) {
            return Some(cpu);
        }
    }

    let mut best: Option<(u32, usize)> = None;
    for &cpu in free {
        let free_siblings = topology
            .siblings_of(cpu)
            .iter()
            .filter(|s| free.contains(*s))
            .count();
        if best.is_none_or(|(_, most)| free_siblings > most) {
            best = Some((cpu, free_siblings));
        }
    }
    best.map(|(cpu, _)| cpu)
}

/// Parse a kernel list such as `0-3,8,10-11`. Blank input is an empty list.
///
/// # Errors
///
/// `CoreSchedError::MalformedList`.
pub fn parse_cpu_list(text: &str) -> Result<Vec<u32>, CoreSchedError> {
    let text = text.trim();
    let bad = || CoreSchedError::MalformedList(text.to_owned());
    let mut out = Vec::new();
    if text.is_empty() {
        return Ok(out);
    }
    for part in text.split(',').map(str::trim) {
        if let Some((lo, hi)) = part.split_once('-') {
            let lo: u32 = lo.trim().parse().map_err(|_| bad())?;
            let hi: u32 = hi.trim().parse().map_err(|_| bad())?;
            if lo > hi {
                return Err(bad());
            }
            out.extend(lo..=hi);
        } else {
            out.push(part.parse().map_err(|_| bad())?);
        }
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// Format a list comma-separated, as written to cpuset files.
#[must_use]
pub fn format_cpu_list(list: &[u32]) -> String {
    list.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn nonempty_or<'a>(mems: &'a [u32], fallback: &'a [u32]) -> &'a [u32] {
    if mems.is_empty() {
        fallback
    } else {
        mems
    }
}

/// Core scheduler over a topology source and a cpuset sink.
pub struct CoreSched<T, S> {
    source: T,
    sink: S,
    attribute: String,
    topology: RwLock<Option<Arc<Topology>>>,
}

impl<T: TopologySource, S: CpusetSink> CoreSched<T, S> {
    /// Scheduler reading requests from the `cpu_cores` attribute.
    pub fn new(source: T, sink: S) -> Self {
        Self {
            source,
            sink,
            attribute: DEFAULT_CORE_ATTRIBUTE.to_owned(),
            topology: RwLock::new(None),
        }
    }

    /// Read requests from a different rspec attribute.
    #[must_use]
    pub fn with_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = attribute.into();
        self
    }

    /// The sink cpusets are written to.
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Topology, discovered once and cached. An empty result is not cached.
    ///
    /// # Errors
    ///
    /// Whatever the topology source reports.
    pub fn topology(&self) -> Result<Arc<Topology>, CoreSchedError> {
        if let Some(topology) = self.topology.read().as_ref() {
            return Ok(Arc::clone(topology));
        }
        let mut slot = self.topology.write();
        if let Some(topology) = slot.as_ref() {
            return Ok(Arc::clone(topology));
        }
        let discovered = Arc::new(self.source.discover()?);
        if discovered.is_empty() {
            warn!("topology is empty, will retry discovery next pass");
        } else {
            info!(
                cpus = discovered.cpus.len(),
                mems = discovered.mems.len(),
                "cpu topology cached"
            );
            *slot = Some(Arc::clone(&discovered));
        }
        Ok(discovered)
    }

    /// Core requests of `slivers`, in map order.
    pub fn requests(&self, slivers: &BTreeMap<String, Record>) -> Vec<(String, CoreRequest)> {
        slivers
            .iter()
            .map(|(name, rec)| {
                let value = rec
                    .eff_rspec
                    .get(&self.attribute)
                    .or_else(|| rec.rspec.get(&self.attribute));
                (name.clone(), CoreRequest::parse(value))
            })
            .collect()
    }

    /// Compute the allocation for `slivers` without writing anything.
    ///
    /// # Errors
    ///
    /// Topology discovery failure.
    pub fn plan(&self, slivers: &BTreeMap<String, Record>) -> Result<CoreAllocation, CoreSchedError> {
        let topology = self.topology()?;
        Ok(allocate(&topology, &self.requests(slivers)))
    }

    /// Allocate cores for `slivers` and write every cpuset group.
    ///
    /// The default files are written first, then each group. A failed write is
    /// logged and recorded in the report; the remaining groups still proceed.
    ///
    /// # Errors
    ///
    /// Topology discovery failure or failure to list the groups.
    pub fn adjust_cores(&self, slivers: &BTreeMap<String, Record>) -> Result<CoreSchedReport, CoreSchedError> {
        let topology = self.topology()?;
        let allocation = allocate(&topology, &self.requests(slivers));
        let mut report = CoreSchedReport::default();

        if topology.is_empty() {
            warn!("no cpus discovered, cpusets left untouched");
            report.allocation = allocation;
            return Ok(report);
        }

        // Unpaired groups get the unreserved nodes; all nodes only when none are left.
        let default_mems = nonempty_or(&allocation.default_mems, &topology.mems);
        match self.sink.write_default(&allocation.default_cpus, default_mems) {
            Ok(()) => report.default_written = true,
            Err(e) => error!(error = %e, "failed to write default cpuset"),
        }

        for group in self.sink.groups()? {
            let cpus = allocation.cpus_for(&group);
            let mems = nonempty_or(allocation.mems_for(&group), default_mems);
            match self.sink.write_group(&group, cpus, mems) {
                Ok(()) => {
                    debug!(group = %group, cpus = %format_cpu_list(cpus), "cpuset written");
                    report.written_groups.push(group);
                }
                Err(e) => {
                    error!(group = %group, error = %e, "failed to write cpuset");
                    report.failed_groups.push(group);
                }
            }
        }

        info!(
            default_cpus = %format_cpu_list(&allocation.default_cpus),
            tenants = allocation.tenants.len(),
            written = report.written_groups.len(),
            failed = report.failed_groups.len(),
            "cores adjusted"
        );
        report.allocation = allocation;
        Ok(report)
    }
}

impl<T, S> std::fmt::Debug for CoreSched<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreSched")
            .field("attribute", &self.attribute)
            .field("cached", &self.topology.read().is_some())
            .finish_non_exhaustive()
    }
}
