//! The record ledger: desired state for every sliver on this node.
//!
//! Records arrive in batches from the desired-state source, are merged under
//! per-key timestamp monotonicity, have their effective rspecs recomputed from
//! loans, and are handed to account workers when dirty. The ledger never waits
//! for account operations; it keeps their handles and looks at the outcomes on
//! the next sync.
//!
//! A dedicated snapshot thread persists the ledger after each sync. Sync only
//! raises a flag and signals a condvar, so slow disks never stall delivery.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::core::account::AccountKind;
use crate::core::registry::AccountRegistry;
use crate::core::worker::OpHandle;
use crate::core::{LedgerError, Loan, Record, ResourceValue, Rspec, SnapshotError, Timestamp};
use crate::infra::snapshot::SnapshotStore;
use crate::util::clock::now_secs;

/// Persistent image of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerImage {
    /// Timestamp of the last complete update; older records not refreshed
    /// by it are stale.
    pub watermark: Timestamp,
    /// Records by record key.
    pub records: BTreeMap<String, Record>,
}

/// Counts describing one delivery or sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Records inserted or updated.
    pub merged: usize,
    /// Records ignored as stale.
    pub ignored: usize,
    /// Records removed because they expired.
    pub expired: usize,
    /// Records removed because the watermark passed them.
    pub purged: usize,
    /// Records whose effective rspec changed.
    pub rspec_changed: usize,
    /// Ensure-created operations dispatched.
    pub dispatched: usize,
    /// Ensure-destroyed operations dispatched for orphaned accounts.
    pub destroyed: usize,
    /// Records that could not be dispatched (kept dirty for the next sync).
    pub dispatch_failures: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Delivery {
    /// Complete desired state as of `watermark`; advances the watermark and
    /// sweeps orphans.
    Full { watermark: Timestamp },
    /// A single-sliver update; watermark untouched.
    Partial,
}

struct LedgerState {
    image: LedgerImage,
    pending: HashMap<String, OpHandle>,
    dump_requested: bool,
    shutdown: bool,
}

impl LedgerState {
    /// Merge one record. Returns false when the record was ignored as stale.
    fn merge(&mut self, incoming: Record) -> bool {
        let floor = self.image.watermark;
        match self.image.records.get_mut(&incoming.record_key) {
            Some(stored) => {
                if incoming.timestamp <= floor.max(stored.timestamp) {
                    trace!(key = %incoming.record_key, ts = incoming.timestamp, "stale record ignored");
                    return false;
                }
                let changed = !stored.same_desired_state(&incoming);
                stored.absorb(incoming);
                if changed {
                    stored.dirty = true;
                }
                true
            }
            None => {
                if incoming.timestamp <= floor {
                    trace!(key = %incoming.record_key, ts = incoming.timestamp, "record below watermark ignored");
                    return false;
                }
                let mut rec = incoming;
                rec.eff_rspec = Rspec::new();
                rec.dirty = true;
                self.image.records.insert(rec.record_key.clone(), rec);
                true
            }
        }
    }

    /// Raise the watermark and drop older records that `refreshed` does not
    /// name. Returns the purge count.
    fn advance_watermark(&mut self, watermark: Timestamp, refreshed: &BTreeSet<String>) -> usize {
        self.image.watermark = watermark;
        let before = self.image.records.len();
        self.image
            .records
            .retain(|key, r| r.timestamp >= watermark || refreshed.contains(key));
        before - self.image.records.len()
    }

    fn expire(&mut self, now: Timestamp) -> usize {
        let before = self.image.records.len();
        self.image.records.retain(|key, r| {
            let expired = r.is_expired(now);
            if expired {
                info!(key = %key, sliver = %r.name, "record expired");
            }
            !expired
        });
        before - self.image.records.len()
    }

    fn find(&self, name: &str) -> Option<&Record> {
        self.image.records.values().find(|r| r.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut Record> {
        self.image.records.values_mut().find(|r| r.name == name)
    }

    /// Collect finished dispatches; failed ones mark their record dirty again.
    fn reap_pending(&mut self) {
        let mut failed = Vec::new();
        self.pending.retain(|name, handle| match handle.try_outcome() {
            Ok(None) => true,
            Ok(Some(outcome)) => {
                if let Err(e) = outcome.result {
                    debug!(sliver = %name, error = %e, "previous dispatch failed, retrying");
                    failed.push(name.clone());
                }
                false
            }
            Err(e) => {
                warn!(sliver = %name, error = %e, "dispatch lost");
                failed.push(name.clone());
                false
            }
        });
        for rec in self.image.records.values_mut() {
            if failed.contains(&rec.name) {
                rec.dirty = true;
            }
        }
    }
}

struct Shared {
    state: Mutex<LedgerState>,
    dump: Condvar,
}

impl Shared {
    fn request_dump(&self, state: &mut LedgerState) {
        state.dump_requested = true;
        self.dump.notify_one();
    }
}

/// Desired-state store and reconciler.
pub struct Ledger {
    shared: Arc<Shared>,
    registry: Arc<AccountRegistry>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Ledger {
    /// Create an empty ledger with no persistence.
    pub fn new(registry: Arc<AccountRegistry>) -> Self {
        Self::with_image(LedgerImage::default(), registry)
    }

    /// Load the last snapshot from `store` and start the snapshot writer.
    ///
    /// A missing snapshot starts an empty ledger. An unreadable one is logged
    /// and also starts empty; the next full delivery restores the state.
    ///
    /// # Errors
    ///
    /// `LedgerError::Snapshot` if the writer thread cannot be spawned.
    pub fn open(store: SnapshotStore, registry: Arc<AccountRegistry>) -> Result<Self, LedgerError> {
        let image = match store.load() {
            Ok(Some(image)) => {
                info!(
                    path = %store.path().display(),
                    records = image.records.len(),
                    watermark = image.watermark,
                    "ledger snapshot loaded"
                );
                image
            }
            Ok(None) => {
                info!(path = %store.path().display(), "no ledger snapshot, starting empty");
                LedgerImage::default()
            }
            Err(e) => {
                error!(path = %store.path().display(), error = %e, "failed to load ledger snapshot, starting empty");
                LedgerImage::default()
            }
        };

        let ledger = Self::with_image(image, registry);
        let shared = Arc::clone(&ledger.shared);
        let path = store.path().display().to_string();
        let handle = thread::Builder::new()
            .name("ledger-snapshot".into())
            .spawn(move || run_snapshot_writer(&shared, &store))
            .map_err(|source| SnapshotError::Io { path, source })?;
        *ledger.writer.lock() = Some(handle);
        Ok(ledger)
    }

    fn with_image(image: LedgerImage, registry: Arc<AccountRegistry>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(LedgerState {
                    image,
                    pending: HashMap::new(),
                    dump_requested: false,
                    shutdown: false,
                }),
                dump: Condvar::new(),
            }),
            registry,
            writer: Mutex::new(None),
        }
    }

    /// Apply a complete desired-state batch.
    ///
    /// Every record is validated before any is merged. The watermark rises to
    /// the oldest timestamp in the batch, stored records older than that and
    /// absent from the batch are purged, and host accounts with no record are
    /// destroyed.
    ///
    /// # Errors
    ///
    /// `LedgerError::InvalidRecord`; the ledger is unchanged in that case.
    pub fn deliver_records(&self, records: Vec<Record>) -> Result<SyncReport, LedgerError> {
        let oldest = records
            .iter()
            .map(|r| r.timestamp)
            .reduce(f64::min)
            .unwrap_or(0.0);
        self.deliver(records, Delivery::Full { watermark: oldest })
    }

    /// Apply a complete desired-state batch stamped `batch_timestamp` by its
    /// source.
    ///
    /// Same as [`Ledger::deliver_records`], except the watermark rises to
    /// `batch_timestamp`. Records in the batch are never purged by it, even
    /// when their own timestamps are older.
    ///
    /// # Errors
    ///
    /// `LedgerError::InvalidRecord` for a bad record or batch timestamp; the
    /// ledger is unchanged in that case.
    pub fn deliver_full_update(
        &self,
        batch_timestamp: Timestamp,
        records: Vec<Record>,
    ) -> Result<SyncReport, LedgerError> {
        if !batch_timestamp.is_finite() || batch_timestamp < 0.0 {
            return Err(LedgerError::InvalidRecord {
                key: "<batch>".into(),
                reason: format!("batch timestamp {batch_timestamp} is not a finite, non-negative number"),
            });
        }
        self.deliver(records, Delivery::Full { watermark: batch_timestamp })
    }

    /// Apply a partial batch (one sliver's ticket) without moving the
    /// watermark or sweeping other accounts.
    ///
    /// # Errors
    ///
    /// `LedgerError::InvalidRecord`; the ledger is unchanged in that case.
    pub fn deliver_ticket(&self, records: Vec<Record>) -> Result<SyncReport, LedgerError> {
        self.deliver(records, Delivery::Partial)
    }

    fn deliver(&self, records: Vec<Record>, mode: Delivery) -> Result<SyncReport, LedgerError> {
        for rec in &records {
            rec.validate()?;
        }
        let refreshed: BTreeSet<String> = records.iter().map(|r| r.record_key.clone()).collect();

        let mut report = SyncReport::default();
        let mut state = self.shared.state.lock();
        for rec in records {
            if state.merge(rec) {
                report.merged += 1;
            } else {
                report.ignored += 1;
            }
        }

        let mut sweep = false;
        if let Delivery::Full { watermark } = mode {
            if watermark > state.image.watermark {
                report.purged = state.advance_watermark(watermark, &refreshed);
                sweep = true;
                debug!(watermark, purged = report.purged, "watermark advanced");
            }
        }

        self.sync_locked(&mut state, sweep, &mut report);
        info!(
            mode = ?mode,
            merged = report.merged,
            ignored = report.ignored,
            dispatched = report.dispatched,
            destroyed = report.destroyed,
            "records delivered"
        );
        Ok(report)
    }

    /// Replace the loans of a sliver and resync.
    ///
    /// # Errors
    ///
    /// `InvalidLoans` if any entry fails shape validation, `UnknownSliver` if
    /// no record has that name.
    pub fn set_loans(&self, name: &str, loans: Vec<Loan>) -> Result<SyncReport, LedgerError> {
        for loan in &loans {
            loan.validate().map_err(LedgerError::InvalidLoans)?;
        }
        let mut state = self.shared.state.lock();
        let rec = state
            .find_mut(name)
            .ok_or_else(|| LedgerError::UnknownSliver(name.to_owned()))?;
        rec.loans = loans;
        let mut report = SyncReport::default();
        self.sync_locked(&mut state, false, &mut report);
        Ok(report)
    }

    /// Run a reconciliation pass without new input.
    pub fn sync(&self) -> SyncReport {
        let mut report = SyncReport::default();
        let mut state = self.shared.state.lock();
        self.sync_locked(&mut state, false, &mut report);
        report
    }

    fn sync_locked(&self, state: &mut LedgerState, mut sweep: bool, report: &mut SyncReport) {
        state.reap_pending();

        report.expired = state.expire(now_secs());
        if report.expired > 0 {
            sweep = true;
        }

        report.rspec_changed = compute_effective_rspecs(&mut state.image.records);

        if sweep {
            self.destroy_orphans(state, report);
        }

        let LedgerState { image, pending, .. } = &mut *state;
        for rec in image.records.values_mut() {
            if !rec.dirty || !rec.plc_instantiated {
                continue;
            }
            match self.registry.get(&rec.name) {
                Ok(worker) => {
                    pending.insert(rec.name.clone(), worker.ensure_created(rec));
                    rec.dirty = false;
                    report.dispatched += 1;
                }
                Err(e) => {
                    error!(sliver = %rec.name, error = %e, "could not dispatch record");
                    report.dispatch_failures += 1;
                }
            }
        }

        self.shared.request_dump(state);
    }

    fn destroy_orphans(&self, state: &mut LedgerState, report: &mut SyncReport) {
        let live = match self.registry.live_accounts() {
            Ok(live) => live,
            Err(e) => {
                error!(error = %e, "cannot list host accounts, skipping orphan sweep");
                return;
            }
        };
        let wanted: BTreeSet<&str> = state.image.records.values().map(|r| r.name.as_str()).collect();
        let orphans: Vec<String> = live.into_iter().filter(|n| !wanted.contains(n.as_str())).collect();

        for name in orphans {
            match self.registry.get(&name) {
                Ok(worker) => {
                    info!(sliver = %name, "destroying account with no record");
                    state.pending.remove(&name);
                    drop(worker.ensure_destroyed());
                    report.destroyed += 1;
                }
                Err(e) => error!(sliver = %name, error = %e, "could not dispatch destroy"),
            }
        }
    }

    /// Copy of the record for sliver `name`.
    ///
    /// # Errors
    ///
    /// `LedgerError::UnknownSliver`.
    pub fn record(&self, name: &str) -> Result<Record, LedgerError> {
        self.shared
            .state
            .lock()
            .find(name)
            .cloned()
            .ok_or_else(|| LedgerError::UnknownSliver(name.to_owned()))
    }

    /// Declared rspec of `name`.
    ///
    /// # Errors
    ///
    /// `LedgerError::UnknownSliver`.
    pub fn rspec(&self, name: &str) -> Result<Rspec, LedgerError> {
        self.with_record(name, |r| r.rspec.clone())
    }

    /// Effective rspec of `name` after loans.
    ///
    /// # Errors
    ///
    /// `LedgerError::UnknownSliver`.
    pub fn effective_rspec(&self, name: &str) -> Result<Rspec, LedgerError> {
        self.with_record(name, |r| r.eff_rspec.clone())
    }

    /// Loans of `name`.
    ///
    /// # Errors
    ///
    /// `LedgerError::UnknownSliver`.
    pub fn loans(&self, name: &str) -> Result<Vec<Loan>, LedgerError> {
        self.with_record(name, |r| r.loans.clone())
    }

    fn with_record<T>(&self, name: &str, f: impl FnOnce(&Record) -> T) -> Result<T, LedgerError> {
        self.shared
            .state
            .lock()
            .find(name)
            .map(f)
            .ok_or_else(|| LedgerError::UnknownSliver(name.to_owned()))
    }

    /// Resource-holding records by sliver name, for core scheduling.
    pub fn slivers(&self) -> BTreeMap<String, Record> {
        self.shared
            .state
            .lock()
            .image
            .records
            .values()
            .filter(|r| lends(r))
            .map(|r| (r.name.clone(), r.clone()))
            .collect()
    }

    /// Copy of the persistent image.
    pub fn image(&self) -> LedgerImage {
        self.shared.state.lock().image.clone()
    }

    /// Current watermark.
    pub fn watermark(&self) -> Timestamp {
        self.shared.state.lock().image.watermark
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.shared.state.lock().image.records.len()
    }

    /// Whether the ledger holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Worker registry the ledger dispatches to.
    pub fn registry(&self) -> &Arc<AccountRegistry> {
        &self.registry
    }

    /// Flush a final snapshot and stop the writer thread.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.shared.dump.notify_all();
        }
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                warn!("snapshot writer panicked");
            }
        }
        info!("ledger shut down");
    }
}

impl Drop for Ledger {
    fn drop(&mut self) {
        // Signal the writer but do not join; call shutdown() for a clean flush.
        let mut state = self.shared.state.lock();
        if !state.shutdown {
            state.shutdown = true;
            self.shared.dump.notify_all();
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Ledger")
            .field("watermark", &state.image.watermark)
            .field("records", &state.image.records.len())
            .field("pending", &state.pending.len())
            .finish_non_exhaustive()
    }
}

fn run_snapshot_writer(shared: &Shared, store: &SnapshotStore) {
    debug!(path = %store.path().display(), "snapshot writer started");
    loop {
        let image = {
            let mut state = shared.state.lock();
            while !state.dump_requested && !state.shutdown {
                shared.dump.wait(&mut state);
            }
            if !state.dump_requested {
                break;
            }
            state.dump_requested = false;
            state.image.clone()
        };
        match store.save(&image) {
            Ok(()) => debug!(records = image.records.len(), "ledger snapshot written"),
            Err(e) => error!(error = %e, "failed to write ledger snapshot"),
        }
    }
    debug!("snapshot writer exiting");
}

/// Whether a record takes part in lending. Kinds that hold no resources
/// (delegates, controllers) are excluded; unknown types are included.
fn lends(rec: &Record) -> bool {
    AccountKind::from_type(&rec.account_type).is_none_or(AccountKind::holds_resources)
}

/// Recompute every record's effective rspec from declared rspecs and loans,
/// marking records dirty when their effective rspec changed.
///
/// Each lender's loans are honored in list order while the remaining amount of
/// the resource covers them; a loan to a missing or non-lending recipient, of
/// a non-integer resource, or larger than what remains is dropped. Returns the
/// number of records whose effective rspec changed.
pub fn compute_effective_rspecs(records: &mut BTreeMap<String, Record>) -> usize {
    let mut prior: BTreeMap<String, Rspec> = BTreeMap::new();
    for (key, rec) in records.iter_mut() {
        let fresh = rec.rspec.clone();
        prior.insert(key.clone(), std::mem::replace(&mut rec.eff_rspec, fresh));
    }

    let members: HashMap<&str, &str> = records
        .iter()
        .filter(|(_, r)| lends(r))
        .map(|(key, r)| (r.name.as_str(), key.as_str()))
        .collect();

    let mut transfers: Vec<(String, String, String, i64)> = Vec::new();
    for (key, rec) in records.iter().filter(|(_, r)| lends(r)) {
        let mut remaining: BTreeMap<&str, i64> = rec
            .rspec
            .iter()
            .filter_map(|(res, v)| v.amount().map(|a| (res.as_str(), a)))
            .collect();
        for loan in &rec.loans {
            let Some(target) = members.get(loan.recipient.as_str()) else {
                trace!(lender = %rec.name, recipient = %loan.recipient, "loan recipient not present");
                continue;
            };
            let Some(left) = remaining.get_mut(loan.resource.as_str()) else {
                trace!(lender = %rec.name, resource = %loan.resource, "lender holds no such amount");
                continue;
            };
            if loan.amount > 0 && loan.amount <= *left {
                *left -= loan.amount;
                transfers.push((key.clone(), (*target).to_owned(), loan.resource.clone(), loan.amount));
            } else {
                trace!(lender = %rec.name, resource = %loan.resource, amount = loan.amount, left = *left, "loan exceeds remaining, dropped");
            }
        }
    }

    for (lender, recipient, resource, amount) in transfers {
        if let Some(rec) = records.get_mut(&lender) {
            adjust(&mut rec.eff_rspec, &resource, -amount);
        }
        if let Some(rec) = records.get_mut(&recipient) {
            adjust(&mut rec.eff_rspec, &resource, amount);
        }
    }

    let mut changed = 0;
    for (key, rec) in records.iter_mut() {
        if prior.get(key) != Some(&rec.eff_rspec) {
            rec.dirty = true;
            changed += 1;
        }
    }
    changed
}

fn adjust(rspec: &mut Rspec, resource: &str, delta: i64) {
    match rspec.get_mut(resource) {
        Some(ResourceValue::Amount(n)) => *n += delta,
        Some(ResourceValue::Text(_)) => {
            warn!(resource, "text-valued resource cannot absorb a loan");
        }
        None => {
            rspec.insert(resource.to_owned(), ResourceValue::Amount(delta));
        }
    }
}
