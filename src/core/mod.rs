//! Ledger, records, account workers, and core scheduling.

pub mod account;
pub mod audit;
pub mod coresched;
pub mod error;
pub mod ledger;
pub mod record;
pub mod registry;
pub mod worker;

pub use account::{AccountBackend, AccountKind, AccountProbe, AccountProvider, BackendTable};
pub use audit::{InMemoryOutcomeSink, OutcomeSink, TracingOutcomeSink};
pub use coresched::{CoreAllocation, CoreRequest, CoreSched, CoreSchedReport, TenantCores};
pub use error::{AccountError, AppResult, CoreSchedError, LedgerError, SnapshotError};
pub use ledger::{compute_effective_rspecs, Ledger, LedgerImage, SyncReport};
pub use record::{Loan, Record, ResourceValue, Rspec, Timestamp, LOANABLE_RESOURCES};
pub use registry::AccountRegistry;
pub use worker::{OpHandle, OpKind, OpOutcome, WaitError, Worker, WorkerStats};
