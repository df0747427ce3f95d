//! In-memory host for development and testing.
//!
//! [`InMemoryHost`] plays the host's account database and every backend kind
//! at once. It records each call, can inject one-shot failures, can slow
//! operations down to expose overlap, and tracks the peak number of
//! concurrent calls per operation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::bail;
use parking_lot::Mutex;

use crate::core::account::{AccountBackend, AccountKind, AccountProbe, AccountProvider};
use crate::core::{AppResult, Record};

/// One call made against the in-memory host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCall {
    /// Backend kind that handled the call.
    pub kind: AccountKind,
    /// Target account.
    pub account: String,
    /// `create`, `destroy`, `configure`, `start`, or `stop`.
    pub op: &'static str,
}

#[derive(Default)]
struct HostState {
    accounts: BTreeMap<String, String>,
    running: BTreeSet<String>,
    variants: BTreeMap<String, String>,
    configured: BTreeMap<String, Record>,
    calls: Vec<HostCall>,
    failures: Vec<(String, &'static str)>,
    probe_broken: bool,
    in_flight: HashMap<&'static str, usize>,
    peak: HashMap<&'static str, usize>,
    account_in_flight: HashMap<String, usize>,
    account_peak: HashMap<String, usize>,
}

/// Simulated host: account database plus backends.
#[derive(Default)]
pub struct InMemoryHost {
    state: Mutex<HostState>,
    op_delay: Duration,
}

impl InMemoryHost {
    /// Empty host with instant operations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every backend call take at least `delay`.
    #[must_use]
    pub fn with_op_delay(mut self, delay: Duration) -> Self {
        self.op_delay = delay;
        self
    }

    /// Provider for `kind`, owning login shell `shell`.
    pub fn provider(self: &Arc<Self>, kind: AccountKind, shell: &str) -> Arc<InMemoryProvider> {
        Arc::new(InMemoryProvider {
            host: Arc::clone(self),
            kind,
            shell: shell.to_owned(),
        })
    }

    /// Add a pre-existing account without logging a call.
    pub fn add_account(&self, name: &str, shell: &str) {
        self.state
            .lock()
            .accounts
            .insert(name.to_owned(), shell.to_owned());
    }

    /// Fail the next `op` against `account`.
    pub fn fail_on(&self, account: &str, op: &'static str) {
        self.state.lock().failures.push((account.to_owned(), op));
    }

    /// Make account probes fail (or succeed again).
    pub fn set_probe_broken(&self, broken: bool) {
        self.state.lock().probe_broken = broken;
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    /// Calls against one account, in order.
    pub fn calls_for(&self, account: &str) -> Vec<HostCall> {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.account == account)
            .cloned()
            .collect()
    }

    /// Whether `name` exists.
    pub fn has_account(&self, name: &str) -> bool {
        self.state.lock().accounts.contains_key(name)
    }

    /// Login shell of `name`.
    pub fn shell(&self, name: &str) -> Option<String> {
        self.state.lock().accounts.get(name).cloned()
    }

    /// Whether `name` is running.
    pub fn is_running(&self, name: &str) -> bool {
        self.state.lock().running.contains(name)
    }

    /// Variant hint `name` was last created with.
    pub fn variant(&self, name: &str) -> Option<String> {
        self.state.lock().variants.get(name).cloned()
    }

    /// Record `name` was last configured with.
    pub fn last_configured(&self, name: &str) -> Option<Record> {
        self.state.lock().configured.get(name).cloned()
    }

    /// Peak number of concurrent calls of `op` seen so far.
    pub fn max_concurrent(&self, op: &str) -> usize {
        self.state.lock().peak.get(op).copied().unwrap_or(0)
    }

    /// Peak number of calls seen in flight at once against `account`.
    pub fn max_concurrent_on(&self, account: &str) -> usize {
        self.state.lock().account_peak.get(account).copied().unwrap_or(0)
    }

    fn perform<T>(
        &self,
        kind: AccountKind,
        account: &str,
        op: &'static str,
        apply: impl FnOnce(&mut HostState) -> AppResult<T>,
    ) -> AppResult<T> {
        {
            let mut state = self.state.lock();
            state.calls.push(HostCall {
                kind,
                account: account.to_owned(),
                op,
            });
            if let Some(pos) = state
                .failures
                .iter()
                .position(|(a, o)| a == account && *o == op)
            {
                state.failures.remove(pos);
                bail!("injected {op} failure for {account}");
            }
            let running = {
                let n = state.in_flight.entry(op).or_default();
                *n += 1;
                *n
            };
            let peak = state.peak.entry(op).or_default();
            *peak = (*peak).max(running);
            let on_account = {
                let n = state.account_in_flight.entry(account.to_owned()).or_default();
                *n += 1;
                *n
            };
            let peak = state.account_peak.entry(account.to_owned()).or_default();
            *peak = (*peak).max(on_account);
        }

        if !self.op_delay.is_zero() {
            thread::sleep(self.op_delay);
        }

        let mut state = self.state.lock();
        if let Some(n) = state.in_flight.get_mut(op) {
            *n = n.saturating_sub(1);
        }
        if let Some(n) = state.account_in_flight.get_mut(account) {
            *n = n.saturating_sub(1);
        }
        apply(&mut *state)
    }
}

impl AccountProbe for InMemoryHost {
    fn shell_of(&self, name: &str) -> AppResult<Option<String>> {
        let state = self.state.lock();
        if state.probe_broken {
            bail!("account database unavailable");
        }
        Ok(state.accounts.get(name).cloned())
    }

    fn accounts(&self) -> AppResult<Vec<(String, String)>> {
        let state = self.state.lock();
        if state.probe_broken {
            bail!("account database unavailable");
        }
        Ok(state
            .accounts
            .iter()
            .map(|(n, s)| (n.clone(), s.clone()))
            .collect())
    }
}

/// In-memory provider for one backend kind.
pub struct InMemoryProvider {
    host: Arc<InMemoryHost>,
    kind: AccountKind,
    shell: String,
}

impl AccountProvider for InMemoryProvider {
    fn kind(&self) -> AccountKind {
        self.kind
    }

    fn shell(&self) -> &str {
        &self.shell
    }

    fn create(&self, name: &str, variant_hint: Option<&str>) -> AppResult<()> {
        self.host.perform(self.kind, name, "create", |state| {
            if state.accounts.contains_key(name) {
                bail!("account {name} already exists");
            }
            state.accounts.insert(name.to_owned(), self.shell.clone());
            if let Some(variant) = variant_hint {
                state.variants.insert(name.to_owned(), variant.to_owned());
            }
            Ok(())
        })
    }

    fn destroy(&self, name: &str) -> AppResult<()> {
        self.host.perform(self.kind, name, "destroy", |state| {
            if state.accounts.remove(name).is_none() {
                bail!("account {name} does not exist");
            }
            state.running.remove(name);
            state.configured.remove(name);
            Ok(())
        })
    }

    fn instantiate(&self, name: &str) -> Box<dyn AccountBackend> {
        Box::new(InMemoryAccount {
            host: Arc::clone(&self.host),
            kind: self.kind,
            name: name.to_owned(),
        })
    }
}

/// In-memory backend instance bound to one account.
pub struct InMemoryAccount {
    host: Arc<InMemoryHost>,
    kind: AccountKind,
    name: String,
}

impl AccountBackend for InMemoryAccount {
    fn configure(&mut self, rec: &Record) -> AppResult<()> {
        let name = self.name.as_str();
        self.host.perform(self.kind, name, "configure", |state| {
            if !state.accounts.contains_key(name) {
                bail!("account {name} does not exist");
            }
            state.configured.insert(name.to_owned(), rec.clone());
            Ok(())
        })
    }

    fn start(&mut self) -> AppResult<()> {
        let name = self.name.as_str();
        self.host.perform(self.kind, name, "start", |state| {
            if !state.accounts.contains_key(name) {
                bail!("account {name} does not exist");
            }
            state.running.insert(name.to_owned());
            Ok(())
        })
    }

    fn stop(&mut self) -> AppResult<()> {
        let name = self.name.as_str();
        self.host.perform(self.kind, name, "stop", |state| {
            state.running.remove(name);
            Ok(())
        })
    }

    fn is_running(&self) -> AppResult<bool> {
        Ok(self.host.is_running(&self.name))
    }
}
