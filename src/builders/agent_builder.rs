//! Builders to assemble an agent from configuration.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::config::{AgentConfig, ProbeBackendConfig, TopologyBackendConfig};
use crate::core::account::{AccountKind, AccountProbe, AccountProvider, BackendTable};
use crate::core::audit::InMemoryOutcomeSink;
use crate::core::coresched::{CoreSched, CoreSchedReport};
use crate::core::ledger::{Ledger, SyncReport};
use crate::core::registry::AccountRegistry;
use crate::core::{AppResult, Record};
use crate::infra::cgroup::CgroupFs;
use crate::infra::memory::InMemoryHost;
use crate::infra::passwd::PasswdProbe;
use crate::infra::snapshot::SnapshotStore;
use crate::infra::topology::{FlatTopology, SysfsTopology, TopologySource};
use crate::runtime::api::NodeApi;

/// Core scheduler as built from configuration.
pub type ConfiguredCoreSched = CoreSched<Box<dyn TopologySource>, CgroupFs>;

/// A fully wired agent.
pub struct Agent {
    /// Desired-state ledger.
    pub ledger: Arc<Ledger>,
    /// Journal of recent account operation outcomes.
    pub outcomes: Arc<InMemoryOutcomeSink>,
    /// Core scheduler, when enabled.
    pub coresched: Option<ConfiguredCoreSched>,
    /// The simulated host, when the in-memory probe is configured.
    pub host: Option<Arc<InMemoryHost>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("coresched", &self.coresched.is_some())
            .field("host", &self.host.is_some())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Node API over this agent's ledger.
    pub fn api(&self) -> NodeApi {
        NodeApi::new(Arc::clone(&self.ledger))
    }

    /// Deliver a complete desired-state batch, then rebalance cores.
    ///
    /// # Errors
    ///
    /// Rejected batch or core scheduler failure. The ledger update stands even
    /// when core scheduling fails.
    pub fn apply_full_update(&self, records: Vec<Record>) -> AppResult<(SyncReport, Option<CoreSchedReport>)> {
        let sync = self
            .ledger
            .deliver_records(records)
            .context("delivering records")?;
        let cores = match &self.coresched {
            Some(coresched) => Some(
                coresched
                    .adjust_cores(&self.ledger.slivers())
                    .context("adjusting cores")?,
            ),
            None => None,
        };
        Ok((sync, cores))
    }

    /// Flush the ledger snapshot and stop its writer.
    pub fn shutdown(&self) {
        self.ledger.shutdown();
    }
}

/// Build an agent from configuration.
///
/// `provider_factory` is called once per configured account kind with the
/// kind's login shell and returns the provider for it, or `None` when this
/// host does not support the kind. With the in-memory probe the factory is
/// not used; every configured kind is simulated.
///
/// # Errors
///
/// Invalid configuration, factory failure, or ledger startup failure.
pub fn build_agent<FP>(cfg: &AgentConfig, mut provider_factory: FP) -> AppResult<Agent>
where
    FP: FnMut(AccountKind, &str) -> AppResult<Option<Arc<dyn AccountProvider>>>,
{
    cfg.validate()
        .map_err(|e| anyhow::anyhow!("config invalid: {e}"))?;

    let host = (cfg.accounts.probe == ProbeBackendConfig::InMemory).then(|| Arc::new(InMemoryHost::new()));
    let probe: Arc<dyn AccountProbe> = match &host {
        Some(host) => host.clone(),
        None => Arc::new(PasswdProbe::new(&cfg.accounts.passwd_path)),
    };

    let mut backends = BackendTable::new(probe);
    for (kind, shell) in cfg.accounts.kinds() {
        let provider: Option<Arc<dyn AccountProvider>> = match &host {
            Some(host) => Some(host.provider(kind, shell)),
            None => provider_factory(kind, shell)
                .with_context(|| format!("building provider for {kind}"))?,
        };
        match provider {
            Some(provider) => backends.register(provider),
            None => warn!(kind = %kind, "no backend for account type on this host"),
        }
    }

    let outcomes = Arc::new(InMemoryOutcomeSink::new(cfg.accounts.outcome_history));
    let registry = Arc::new(
        AccountRegistry::new(backends)
            .with_outcome_sink(outcomes.clone())
            .with_stack_size(cfg.accounts.worker_stack_size),
    );

    let ledger = match &cfg.snapshot_path {
        Some(path) => Ledger::open(SnapshotStore::new(path), registry).context("opening ledger")?,
        None => Ledger::new(registry),
    };

    let coresched = cfg.coresched.enabled.then(|| {
        let c = &cfg.coresched;
        let source: Box<dyn TopologySource> = match c.topology {
            TopologyBackendConfig::Sysfs => Box::new(SysfsTopology::new(
                &c.cpuset_root,
                &c.cpu_sysfs_root,
                &c.node_sysfs_root,
            )),
            TopologyBackendConfig::Flat => Box::new(FlatTopology::detected()),
        };
        CoreSched::new(source, CgroupFs::new(&c.cpuset_root, &c.defaults_dir))
            .with_attribute(c.core_attribute.clone())
    });

    info!(
        records = ledger.len(),
        coresched = coresched.is_some(),
        in_memory_host = host.is_some(),
        "agent assembled"
    );

    Ok(Agent {
        ledger: Arc::new(ledger),
        outcomes,
        coresched,
        host,
    })
}
