//! Desired-state records, resource specifications, and loans.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::LedgerError;

/// Resources a sliver may lend to another sliver.
///
/// Disk is deliberately absent: there is no way to punish a sliver that runs
/// over a borrowed disk quota.
pub const LOANABLE_RESOURCES: &[&str] = &[
    "cpu_min",
    "cpu_share",
    "net_min_rate",
    "net_max_rate",
    "net_i2_min_rate",
    "net_i2_max_rate",
    "net_share",
];

/// A single rspec value: an integer amount or an opaque text setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceValue {
    /// Integer amount; the only form loans can move.
    Amount(i64),
    /// Text value such as `cpu_cores = "2b"` or a capability list.
    Text(String),
}

impl ResourceValue {
    /// Integer amount, if this value is one.
    #[must_use]
    pub const fn amount(&self) -> Option<i64> {
        match self {
            Self::Amount(n) => Some(*n),
            Self::Text(_) => None,
        }
    }
}

impl From<i64> for ResourceValue {
    fn from(n: i64) -> Self {
        Self::Amount(n)
    }
}

impl From<i32> for ResourceValue {
    fn from(n: i32) -> Self {
        Self::Amount(i64::from(n))
    }
}

impl From<&str> for ResourceValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl fmt::Display for ResourceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amount(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Resource specification: resource name to value.
pub type Rspec = BTreeMap<String, ResourceValue>;

/// A promise by the owning record to give `amount` of its own
/// `rspec[resource]` to the sliver named `recipient`.
///
/// Serialized as a three-element array `[recipient, resource, amount]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, String, i64)", into = "(String, String, i64)")]
pub struct Loan {
    /// Sliver name receiving the resource.
    pub recipient: String,
    /// Resource name.
    pub resource: String,
    /// Amount lent.
    pub amount: i64,
}

impl Loan {
    /// Build a loan entry.
    pub fn new(recipient: impl Into<String>, resource: impl Into<String>, amount: i64) -> Self {
        Self {
            recipient: recipient.into(),
            resource: resource.into(),
            amount,
        }
    }

    /// Shape check applied at the API boundary. Capacity is never checked
    /// here; over-committed loans are dropped silently when rspecs are
    /// recomputed.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.recipient.is_empty() {
            return Err("recipient must be a non-empty string".into());
        }
        if !LOANABLE_RESOURCES.contains(&self.resource.as_str()) {
            return Err(format!("resource `{}` cannot be loaned", self.resource));
        }
        if self.amount <= 0 {
            return Err(format!("amount must be positive, got {}", self.amount));
        }
        Ok(())
    }

    /// Parse and validate an untyped loan list, as received from a caller.
    ///
    /// A valid list is an array whose every entry is a three-element array of
    /// (non-empty string, loanable resource name, positive integer).
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidLoans` naming the offending entry.
    pub fn parse_list(value: &serde_json::Value) -> Result<Vec<Self>, LedgerError> {
        let entries = value
            .as_array()
            .ok_or_else(|| LedgerError::InvalidLoans("expected a list of loans".into()))?;
        entries
            .iter()
            .enumerate()
            .map(|(idx, entry)| {
                let bad = |why: &str| LedgerError::InvalidLoans(format!("entry {idx}: {why}"));
                let parts = entry
                    .as_array()
                    .filter(|p| p.len() == 3)
                    .ok_or_else(|| bad("expected [recipient, resource, amount]"))?;
                let recipient = parts[0].as_str().ok_or_else(|| bad("recipient must be a string"))?;
                let resource = parts[1].as_str().ok_or_else(|| bad("resource must be a string"))?;
                let amount = parts[2].as_i64().ok_or_else(|| bad("amount must be an integer"))?;
                let loan = Self::new(recipient, resource, amount);
                loan.validate().map_err(|e| bad(&e))?;
                Ok(loan)
            })
            .collect()
    }
}

impl From<(String, String, i64)> for Loan {
    fn from((recipient, resource, amount): (String, String, i64)) -> Self {
        Self {
            recipient,
            resource,
            amount,
        }
    }
}

impl From<Loan> for (String, String, i64) {
    fn from(loan: Loan) -> Self {
        (loan.recipient, loan.resource, loan.amount)
    }
}

/// Seconds since the Unix epoch; fractional values are accepted.
pub type Timestamp = f64;

/// A desired-state record for one sliver.
///
/// Fields other than `eff_rspec` and `dirty` come from the desired-state
/// source; those two are computed by the ledger. Unrecognized keys are kept
/// in `attributes` and forwarded to backends untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique key of this record in the ledger.
    pub record_key: String,
    /// Account (sliver) name.
    pub name: String,
    /// Account type, selecting the backend kind (e.g. `sliver.LXC`).
    pub account_type: String,
    /// Logical update time; monotonic per key.
    pub timestamp: Timestamp,
    /// Allocation declared for this sliver.
    pub rspec: Rspec,
    /// Outgoing loans, honored in order.
    pub loans: Vec<Loan>,
    /// Grant actually enforced after loans.
    #[serde(default)]
    pub eff_rspec: Rspec,
    /// Whether this node instantiates the account on delivery.
    pub plc_instantiated: bool,
    /// Set when the account needs to be (re)configured.
    #[serde(default)]
    pub dirty: bool,
    /// Absolute expiry, seconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<Timestamp>,
    /// Backend-specific fields (`vref`, `keys`, `initscript`, ...).
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl Record {
    /// Create a record keyed by its sliver name.
    pub fn new(
        name: impl Into<String>,
        account_type: impl Into<String>,
        timestamp: impl Into<Timestamp>,
    ) -> Self {
        let name = name.into();
        Self {
            record_key: name.clone(),
            name,
            account_type: account_type.into(),
            timestamp: timestamp.into(),
            rspec: Rspec::new(),
            loans: Vec::new(),
            eff_rspec: Rspec::new(),
            plc_instantiated: true,
            dirty: false,
            expires: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Set one rspec entry.
    #[must_use]
    pub fn with_resource(mut self, name: impl Into<String>, value: impl Into<ResourceValue>) -> Self {
        self.rspec.insert(name.into(), value.into());
        self
    }

    /// Replace the loan list.
    #[must_use]
    pub fn with_loans(mut self, loans: Vec<Loan>) -> Self {
        self.loans = loans;
        self
    }

    /// Mark whether this node instantiates the account.
    #[must_use]
    pub const fn with_plc_instantiated(mut self, plc_instantiated: bool) -> Self {
        self.plc_instantiated = plc_instantiated;
        self
    }

    /// Set an absolute expiry time.
    #[must_use]
    pub fn with_expires(mut self, expires: impl Into<Timestamp>) -> Self {
        self.expires = Some(expires.into());
        self
    }

    /// Set a backend attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// String attribute, if present.
    #[must_use]
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(serde_json::Value::as_str)
    }

    /// Check required fields. Loans are typed already; their allow-list is
    /// enforced at the API boundary, not here.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidRecord` describing the first problem.
    pub fn validate(&self) -> Result<(), LedgerError> {
        let invalid = |reason: &str| LedgerError::InvalidRecord {
            key: if self.record_key.is_empty() {
                self.name.clone()
            } else {
                self.record_key.clone()
            },
            reason: reason.to_owned(),
        };
        if self.record_key.is_empty() {
            return Err(invalid("record_key is empty"));
        }
        if self.name.is_empty() {
            return Err(invalid("name is empty"));
        }
        if self.account_type.is_empty() {
            return Err(invalid("account_type is empty"));
        }
        if !self.timestamp.is_finite() || self.timestamp < 0.0 {
            return Err(invalid("timestamp must be a finite, non-negative number"));
        }
        if self.expires.is_some_and(|t| !t.is_finite()) {
            return Err(invalid("expires must be a finite number"));
        }
        if self.loans.iter().any(|l| l.recipient.is_empty()) {
            return Err(invalid("loan recipient is empty"));
        }
        Ok(())
    }

    /// True when every desired field except `timestamp` matches.
    #[must_use]
    pub fn same_desired_state(&self, other: &Self) -> bool {
        self.name == other.name
            && self.account_type == other.account_type
            && self.rspec == other.rspec
            && self.loans == other.loans
            && self.plc_instantiated == other.plc_instantiated
            && self.expires == other.expires
            && self.attributes == other.attributes
    }

    /// Copy the desired fields of `incoming` over this record, keeping the
    /// computed `eff_rspec` and `dirty` state.
    pub(crate) fn absorb(&mut self, incoming: Self) {
        let Self {
            eff_rspec, dirty, ..
        } = std::mem::replace(self, incoming);
        self.eff_rspec = eff_rspec;
        self.dirty = dirty;
    }

    /// Whether this record has expired at `now` (seconds since the epoch).
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires.is_some_and(|t| t < now)
    }
}
