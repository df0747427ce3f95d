//! Node API surface over the ledger and account workers.
//!
//! These are the calls a node-manager RPC layer forwards to. Account
//! operations return an [`OpHandle`] immediately; callers decide whether to
//! wait.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::ledger::{Ledger, SyncReport};
use crate::core::worker::OpHandle;
use crate::core::{LedgerError, Loan, Record, Rspec, Timestamp};

/// Summary of one sliver for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliverSummary {
    /// Sliver name.
    pub name: String,
    /// Account type.
    pub account_type: String,
    /// Last accepted timestamp.
    pub timestamp: Timestamp,
    /// Whether this node instantiates it on delivery.
    pub plc_instantiated: bool,
    /// Whether a (re)configuration is outstanding.
    pub dirty: bool,
}

impl From<&Record> for SliverSummary {
    fn from(rec: &Record) -> Self {
        Self {
            name: rec.name.clone(),
            account_type: rec.account_type.clone(),
            timestamp: rec.timestamp,
            plc_instantiated: rec.plc_instantiated,
            dirty: rec.dirty,
        }
    }
}

/// Per-sliver calls of the node API.
#[derive(Debug, Clone)]
pub struct NodeApi {
    ledger: Arc<Ledger>,
}

impl NodeApi {
    /// API over `ledger`.
    pub const fn new(ledger: Arc<Ledger>) -> Self {
        Self { ledger }
    }

    /// Underlying ledger.
    pub const fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Deliver a complete desired-state batch.
    ///
    /// The payload is either a JSON array of records or an object
    /// `{"timestamp": t, "records": [...]}` whose `t` becomes the watermark.
    ///
    /// # Errors
    ///
    /// `InvalidRecord` for a payload that does not decode or validate.
    pub fn deliver_json(&self, payload: &str) -> Result<SyncReport, LedgerError> {
        match decode_batch(payload)? {
            Batch::Stamped { timestamp, records } => self.ledger.deliver_full_update(timestamp, records),
            Batch::Records(records) => self.ledger.deliver_records(records),
        }
    }

    /// Deliver a single-sliver ticket, in either batch encoding. A ticket
    /// never moves the watermark.
    ///
    /// # Errors
    ///
    /// `InvalidRecord` for a payload that does not decode or validate.
    pub fn deliver_ticket_json(&self, payload: &str) -> Result<SyncReport, LedgerError> {
        self.ledger.deliver_ticket(decode_batch(payload)?.into_records())
    }

    /// Create a delegated sliver's account.
    ///
    /// # Errors
    ///
    /// `UnknownSliver`, `NotDelegated` for slivers this node instantiates on
    /// its own, or `Account` if no worker could be started.
    pub fn create(&self, name: &str) -> Result<OpHandle, LedgerError> {
        let rec = self.delegated(name)?;
        Ok(self.ledger.registry().get(&rec.name)?.ensure_created(&rec))
    }

    /// Destroy a delegated sliver's account.
    ///
    /// # Errors
    ///
    /// `UnknownSliver`, `NotDelegated`, or `Account`.
    pub fn destroy(&self, name: &str) -> Result<OpHandle, LedgerError> {
        let rec = self.delegated(name)?;
        Ok(self.ledger.registry().get(&rec.name)?.ensure_destroyed())
    }

    /// Start a sliver.
    ///
    /// # Errors
    ///
    /// `UnknownSliver` or `Account`.
    pub fn start(&self, name: &str) -> Result<OpHandle, LedgerError> {
        let rec = self.ledger.record(name)?;
        Ok(self.ledger.registry().get(&rec.name)?.start())
    }

    /// Stop a sliver.
    ///
    /// # Errors
    ///
    /// `UnknownSliver` or `Account`.
    pub fn stop(&self, name: &str) -> Result<OpHandle, LedgerError> {
        let rec = self.ledger.record(name)?;
        Ok(self.ledger.registry().get(&rec.name)?.stop())
    }

    /// Reinstall a sliver: stop, destroy, create, start, queued back to back
    /// on its worker. Handles are returned in that order.
    ///
    /// # Errors
    ///
    /// `UnknownSliver` or `Account`.
    pub fn recreate(&self, name: &str) -> Result<Vec<OpHandle>, LedgerError> {
        let rec = self.ledger.record(name)?;
        let worker = self.ledger.registry().get(&rec.name)?;
        Ok(vec![
            worker.stop(),
            worker.ensure_destroyed(),
            worker.ensure_created(&rec),
            worker.start(),
        ])
    }

    /// Declared rspec.
    ///
    /// # Errors
    ///
    /// `UnknownSliver`.
    pub fn get_rspec(&self, name: &str) -> Result<Rspec, LedgerError> {
        self.ledger.rspec(name)
    }

    /// Effective rspec after loans.
    ///
    /// # Errors
    ///
    /// `UnknownSliver`.
    pub fn get_effective_rspec(&self, name: &str) -> Result<Rspec, LedgerError> {
        self.ledger.effective_rspec(name)
    }

    /// Loans the sliver has made.
    ///
    /// # Errors
    ///
    /// `UnknownSliver`.
    pub fn get_loans(&self, name: &str) -> Result<Vec<Loan>, LedgerError> {
        self.ledger.loans(name)
    }

    /// Replace the sliver's loans from an untyped list and resync.
    ///
    /// # Errors
    ///
    /// `InvalidLoans` when the list fails shape validation, `UnknownSliver`.
    pub fn set_loans(&self, name: &str, loans: &serde_json::Value) -> Result<SyncReport, LedgerError> {
        let loans = Loan::parse_list(loans)?;
        self.ledger.set_loans(name, loans)
    }

    /// Summary of every stored sliver, sorted by name.
    pub fn list_slivers(&self) -> Vec<SliverSummary> {
        let mut out: Vec<SliverSummary> = self
            .ledger
            .image()
            .records
            .values()
            .map(SliverSummary::from)
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn delegated(&self, name: &str) -> Result<Record, LedgerError> {
        let rec = self.ledger.record(name)?;
        if rec.plc_instantiated {
            return Err(LedgerError::NotDelegated(name.to_owned()));
        }
        Ok(rec)
    }
}

/// Wire forms of a record batch.
#[derive(Deserialize)]
#[serde(untagged)]
enum Batch {
    Stamped { timestamp: Timestamp, records: Vec<Record> },
    Records(Vec<Record>),
}

impl Batch {
    fn into_records(self) -> Vec<Record> {
        match self {
            Self::Stamped { records, .. } | Self::Records(records) => records,
        }
    }
}

fn decode_batch(payload: &str) -> Result<Batch, LedgerError> {
    serde_json::from_str(payload).map_err(|e| LedgerError::InvalidRecord {
        key: "<batch>".into(),
        reason: e.to_string(),
    })
}
