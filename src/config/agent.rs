//! Agent configuration: ledger persistence, account backends, core scheduling.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::account::AccountKind;
use crate::core::coresched::DEFAULT_CORE_ATTRIBUTE;
use crate::core::registry::DEFAULT_WORKER_STACK_SIZE;
use crate::infra::cgroup::DEFAULT_DEFAULTS_DIR;
use crate::infra::passwd::DEFAULT_PASSWD_PATH;
use crate::infra::topology::{DEFAULT_CPUSET_ROOT, DEFAULT_CPU_SYSFS_ROOT, DEFAULT_NODE_SYSFS_ROOT};
use crate::util::telemetry::log_filter;

/// Default ledger snapshot location.
pub const DEFAULT_SNAPSHOT_PATH: &str = "/var/lib/sliver_agent/ledger.json";

/// Smallest accepted worker stack.
const MIN_WORKER_STACK_SIZE: usize = 64 * 1024;

/// Host account database selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeBackendConfig {
    /// passwd(5) file.
    Passwd,
    /// In-memory host for development/testing.
    InMemory,
}

/// Topology source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyBackendConfig {
    /// cpuset root plus sysfs CPU and node trees.
    Sysfs,
    /// One memory node, logical CPU count from the OS.
    Flat,
}

/// Account layer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Host account database.
    pub probe: ProbeBackendConfig,
    /// passwd file read by the `passwd` probe.
    pub passwd_path: PathBuf,
    /// Stack size of each account worker thread, in bytes.
    pub worker_stack_size: usize,
    /// Outcomes kept in the in-memory journal.
    pub outcome_history: usize,
    /// Account type to login shell, for every kind this host supports.
    pub shells: BTreeMap<String, String>,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        let shells = [
            (AccountKind::VServer, "/bin/vsh"),
            (AccountKind::Lxc, "/bin/bash"),
            (AccountKind::Libvirt, "/bin/sh"),
            (AccountKind::Delegate, "/bin/forward_api_calls"),
            (AccountKind::Controller, "/usr/bin/forward_api_calls"),
        ]
        .into_iter()
        .map(|(kind, shell)| (kind.type_name().to_owned(), shell.to_owned()))
        .collect();
        Self {
            probe: ProbeBackendConfig::Passwd,
            passwd_path: PathBuf::from(DEFAULT_PASSWD_PATH),
            worker_stack_size: DEFAULT_WORKER_STACK_SIZE,
            outcome_history: 1024,
            shells,
        }
    }
}

impl AccountsConfig {
    /// Configured kinds with their shells.
    ///
    /// Only meaningful after [`AccountsConfig::validate`] succeeded; unknown
    /// type names are skipped.
    pub fn kinds(&self) -> impl Iterator<Item = (AccountKind, &str)> + '_ {
        self.shells
            .iter()
            .filter_map(|(ty, shell)| AccountKind::from_type(ty).map(|k| (k, shell.as_str())))
    }

    /// Validate account settings.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_stack_size < MIN_WORKER_STACK_SIZE {
            return Err(format!(
                "worker_stack_size must be at least {MIN_WORKER_STACK_SIZE} bytes"
            ));
        }
        if self.outcome_history == 0 {
            return Err("outcome_history must be greater than 0".into());
        }
        if self.shells.is_empty() {
            return Err("at least one account type must be configured".into());
        }
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for (ty, shell) in &self.shells {
            if AccountKind::from_type(ty).is_none() {
                return Err(format!("unknown account type `{ty}`"));
            }
            if !shell.starts_with('/') {
                return Err(format!("shell for `{ty}` must be an absolute path"));
            }
            if let Some(other) = seen.insert(shell.as_str(), ty.as_str()) {
                return Err(format!("`{ty}` and `{other}` share shell `{shell}`"));
            }
        }
        Ok(())
    }
}

/// Core scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSchedConfig {
    /// Whether cpusets are managed at all.
    pub enabled: bool,
    /// Topology source.
    pub topology: TopologyBackendConfig,
    /// cpuset controller root; one subdirectory per group.
    pub cpuset_root: PathBuf,
    /// sysfs CPU directory.
    pub cpu_sysfs_root: PathBuf,
    /// sysfs NUMA node directory.
    pub node_sysfs_root: PathBuf,
    /// Directory for the node-wide default cpuset files.
    pub defaults_dir: PathBuf,
    /// Rspec attribute holding the core request.
    pub core_attribute: String,
}

impl Default for CoreSchedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topology: TopologyBackendConfig::Sysfs,
            cpuset_root: PathBuf::from(DEFAULT_CPUSET_ROOT),
            cpu_sysfs_root: PathBuf::from(DEFAULT_CPU_SYSFS_ROOT),
            node_sysfs_root: PathBuf::from(DEFAULT_NODE_SYSFS_ROOT),
            defaults_dir: PathBuf::from(DEFAULT_DEFAULTS_DIR),
            core_attribute: DEFAULT_CORE_ATTRIBUTE.to_owned(),
        }
    }
}

impl CoreSchedConfig {
    /// Validate core scheduler settings.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.core_attribute.trim().is_empty() {
            return Err("core_attribute must not be empty".into());
        }
        if self.enabled && self.defaults_dir.starts_with(&self.cpuset_root) {
            return Err("defaults_dir must not live under cpuset_root".into());
        }
        Ok(())
    }
}

/// Root agent configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Ledger snapshot file; `None` keeps the ledger in memory only.
    pub snapshot_path: Option<PathBuf>,
    /// Tracing filter directives; `None` falls back to `RUST_LOG`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
    /// Account layer.
    pub accounts: AccountsConfig,
    /// Core scheduler.
    pub coresched: CoreSchedConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            snapshot_path: Some(PathBuf::from(DEFAULT_SNAPSHOT_PATH)),
            log_filter: None,
            accounts: AccountsConfig::default(),
            coresched: CoreSchedConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns a description naming the failing section.
    pub fn validate(&self) -> Result<(), String> {
        if self
            .snapshot_path
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            return Err("snapshot_path must not be empty".into());
        }
        if let Some(filter) = &self.log_filter {
            log_filter(Some(filter))?;
        }
        self.accounts
            .validate()
            .map_err(|e| format!("accounts invalid: {e}"))?;
        self.coresched
            .validate()
            .map_err(|e| format!("coresched invalid: {e}"))?;
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Parse or validation failure.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from the environment.
    ///
    /// Loads `.env` if present. `SLIVER_CONFIG` names a JSON file to start
    /// from (defaults otherwise); individual `SLIVER_*` variables override it.
    ///
    /// # Errors
    ///
    /// Unreadable config file, malformed variable, or validation failure.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        let mut cfg = match std::env::var("SLIVER_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|e| format!("reading {path}: {e}"))?;
                serde_json::from_str(&text).map_err(|e| format!("parse error in {path}: {e}"))?
            }
            Err(_) => Self::default(),
        };
        cfg.apply_overrides(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `SLIVER_*` overrides read through `lookup`.
    ///
    /// # Errors
    ///
    /// A variable that does not parse.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        if let Some(v) = lookup("SLIVER_SNAPSHOT_PATH") {
            self.snapshot_path = if v.is_empty() || v == "none" {
                None
            } else {
                Some(PathBuf::from(v))
            };
        }
        if let Some(v) = lookup("SLIVER_LOG") {
            self.log_filter = Some(v);
        }
        if let Some(v) = lookup("SLIVER_PASSWD_PATH") {
            self.accounts.passwd_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("SLIVER_WORKER_STACK_SIZE") {
            self.accounts.worker_stack_size = parse_var("SLIVER_WORKER_STACK_SIZE", &v)?;
        }
        if let Some(v) = lookup("SLIVER_OUTCOME_HISTORY") {
            self.accounts.outcome_history = parse_var("SLIVER_OUTCOME_HISTORY", &v)?;
        }
        if let Some(v) = lookup("SLIVER_CORESCHED_ENABLED") {
            self.coresched.enabled = parse_var("SLIVER_CORESCHED_ENABLED", &v)?;
        }
        if let Some(v) = lookup("SLIVER_CPUSET_ROOT") {
            self.coresched.cpuset_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("SLIVER_CPU_SYSFS_ROOT") {
            self.coresched.cpu_sysfs_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("SLIVER_NODE_SYSFS_ROOT") {
            self.coresched.node_sysfs_root = PathBuf::from(v);
        }
        if let Some(v) = lookup("SLIVER_CPUSET_DEFAULTS_DIR") {
            self.coresched.defaults_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SLIVER_CORE_ATTRIBUTE") {
            self.coresched.core_attribute = v;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("{key}={value}: {e}"))
}
