//! Account kinds, backend capability traits, and the kind dispatch table.
//!
//! A host account is managed by exactly one backend kind. The live kind of an
//! account is observed through its login shell: every provider owns a unique
//! shell, and [`BackendTable::live_kind`] is the single probe that maps what
//! the host reports back to a kind.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{AccountError, AppResult, Record};

/// Backend kinds known to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccountKind {
    /// Linux-VServer container sliver.
    VServer,
    /// LXC container sliver.
    Lxc,
    /// libvirt-managed VM sliver.
    Libvirt,
    /// Delegate account tunnelling API calls; holds no resources.
    Delegate,
    /// Controller account tunnelling API calls; holds no resources.
    Controller,
}

impl AccountKind {
    /// Every known kind.
    pub const ALL: [Self; 5] = [
        Self::VServer,
        Self::Lxc,
        Self::Libvirt,
        Self::Delegate,
        Self::Controller,
    ];

    /// The `account_type` string naming this kind in records.
    #[must_use]
    pub const fn type_name(self) -> &'static str {
        match self {
            Self::VServer => "sliver.VServer",
            Self::Lxc => "sliver.LXC",
            Self::Libvirt => "sliver.LIBVIRT",
            Self::Delegate => "delegate",
            Self::Controller => "controller.Controller",
        }
    }

    /// Whether accounts of this kind hold an rspec that can lend or borrow.
    #[must_use]
    pub const fn holds_resources(self) -> bool {
        matches!(self, Self::VServer | Self::Lxc | Self::Libvirt)
    }

    /// Look up a kind by its `account_type` string.
    #[must_use]
    pub fn from_type(account_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.type_name() == account_type)
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl FromStr for AccountKind {
    type Err = AccountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_type(s).ok_or_else(|| AccountError::UnknownType(s.to_owned()))
    }
}

/// Per-account operations of a backend instance.
///
/// Instances are created by [`AccountProvider::instantiate`] and are owned by
/// exactly one worker thread, so implementations never see concurrent calls.
pub trait AccountBackend: Send {
    /// Apply the record's configuration (resource limits, keys, scripts).
    fn configure(&mut self, rec: &Record) -> AppResult<()>;
    /// Start the account's workload.
    fn start(&mut self) -> AppResult<()>;
    /// Stop the account's workload.
    fn stop(&mut self) -> AppResult<()>;
    /// Whether the account's workload is running.
    fn is_running(&self) -> AppResult<bool>;
}

/// Class-level operations of one backend kind.
///
/// `create` and `destroy` are not safe to run concurrently across accounts;
/// workers call them only while holding the node-wide structural permits.
pub trait AccountProvider: Send + Sync {
    /// Kind implemented by this provider.
    fn kind(&self) -> AccountKind;
    /// Login shell that marks an account as belonging to this provider.
    fn shell(&self) -> &str;
    /// Create the host account. `variant_hint` selects an image or reference
    /// where the backend supports several (e.g. the record's `vref`).
    fn create(&self, name: &str, variant_hint: Option<&str>) -> AppResult<()>;
    /// Destroy the host account.
    fn destroy(&self, name: &str) -> AppResult<()>;
    /// Build a backend instance bound to an existing account.
    fn instantiate(&self, name: &str) -> Box<dyn AccountBackend>;
}

/// Read-only view of the host's account database.
pub trait AccountProbe: Send + Sync {
    /// Login shell of `name`, or `None` if no such account exists.
    fn shell_of(&self, name: &str) -> AppResult<Option<String>>;
    /// Every account on the host as `(name, shell)` pairs.
    fn accounts(&self) -> AppResult<Vec<(String, String)>>;
}

/// Dispatch table from account kind to provider, plus the live-kind probe.
pub struct BackendTable {
    probe: Arc<dyn AccountProbe>,
    providers: BTreeMap<AccountKind, Arc<dyn AccountProvider>>,
}

impl BackendTable {
    /// Create an empty table over a host probe.
    pub fn new(probe: Arc<dyn AccountProbe>) -> Self {
        Self {
            probe,
            providers: BTreeMap::new(),
        }
    }

    /// Register a provider, replacing any earlier one for the same kind.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn AccountProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Register a provider, replacing any earlier one for the same kind.
    pub fn register(&mut self, provider: Arc<dyn AccountProvider>) {
        tracing::debug!(kind = %provider.kind(), shell = provider.shell(), "registered account provider");
        self.providers.insert(provider.kind(), provider);
    }

    /// Kinds that have a provider.
    pub fn kinds(&self) -> impl Iterator<Item = AccountKind> + '_ {
        self.providers.keys().copied()
    }

    /// Provider for `kind`.
    ///
    /// # Errors
    ///
    /// `AccountError::Unregistered` if no provider handles the kind.
    pub fn provider(&self, kind: AccountKind) -> Result<&Arc<dyn AccountProvider>, AccountError> {
        self.providers
            .get(&kind)
            .ok_or_else(|| AccountError::Unregistered(kind.type_name().to_owned()))
    }

    /// Kind a record asks for, which must have a provider.
    ///
    /// # Errors
    ///
    /// `UnknownType` for an unrecognized string, `Unregistered` for a known
    /// kind without a provider.
    pub fn target_kind(&self, account_type: &str) -> Result<AccountKind, AccountError> {
        let kind: AccountKind = account_type.parse()?;
        self.provider(kind)?;
        Ok(kind)
    }

    /// Kind owning a login shell.
    #[must_use]
    pub fn kind_for_shell(&self, shell: &str) -> Option<AccountKind> {
        self.providers
            .values()
            .find(|p| p.shell() == shell)
            .map(|p| p.kind())
    }

    /// Probe the host for the current kind of `name`.
    ///
    /// # Errors
    ///
    /// `Probe` if the host database cannot be read; `UnmanagedShell` if the
    /// account exists under a shell no provider owns (it is not ours to touch).
    pub fn live_kind(&self, name: &str) -> Result<Option<AccountKind>, AccountError> {
        let shell = self
            .probe
            .shell_of(name)
            .map_err(|e| AccountError::Probe(format!("{e:#}")))?;
        match shell {
            None => Ok(None),
            Some(shell) => self
                .kind_for_shell(&shell)
                .map(Some)
                .ok_or_else(|| AccountError::UnmanagedShell {
                    name: name.to_owned(),
                    shell,
                }),
        }
    }

    /// Names of all host accounts whose shell belongs to a registered provider.
    ///
    /// # Errors
    ///
    /// `Probe` if the host database cannot be read.
    pub fn live_accounts(&self) -> Result<Vec<String>, AccountError> {
        let accounts = self
            .probe
            .accounts()
            .map_err(|e| AccountError::Probe(format!("{e:#}")))?;
        Ok(accounts
            .into_iter()
            .filter(|(_, shell)| self.kind_for_shell(shell).is_some())
            .map(|(name, _)| name)
            .collect())
    }
}

impl fmt::Debug for BackendTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendTable")
            .field("kinds", &self.providers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
