//! Error types for ledger, account, and core-scheduling operations.

use thiserror::Error;

/// Errors raised while validating or merging desired-state records.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A delivered record is missing a required field or carries a bad value.
    #[error("invalid record `{key}`: {reason}")]
    InvalidRecord {
        /// Record key (or name) of the offending record.
        key: String,
        /// What was wrong with it.
        reason: String,
    },
    /// A loan specification failed shape validation.
    #[error("invalid loan specification: {0}")]
    InvalidLoans(String),
    /// No record is stored under this sliver name.
    #[error("unknown sliver: {0}")]
    UnknownSliver(String),
    /// The operation only applies to delegated (non-PLC-instantiated) slivers.
    #[error("sliver `{0}` is not delegated")]
    NotDelegated(String),
    /// Account layer failure surfaced synchronously (e.g. worker spawn).
    #[error(transparent)]
    Account(#[from] AccountError),
    /// Persistence failure.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

/// Errors produced by account workers and backend dispatch.
///
/// Cloneable so a single outcome can be handed to the waiting caller and to
/// the outcome sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    /// `account_type` names no known account kind.
    #[error("unknown account type `{0}`")]
    UnknownType(String),
    /// The kind is known but no provider was registered for it.
    #[error("no backend registered for {0}")]
    Unregistered(String),
    /// The account does not exist on the host.
    #[error("account `{0}` does not exist")]
    Missing(String),
    /// The account exists but its shell belongs to no registered provider.
    #[error("account `{name}` has unmanaged shell `{shell}`")]
    UnmanagedShell {
        /// Account name.
        name: String,
        /// Login shell found on the host.
        shell: String,
    },
    /// A backend call failed.
    #[error("{op} failed for `{name}`: {reason}")]
    Backend {
        /// Account name.
        name: String,
        /// Backend operation that failed.
        op: &'static str,
        /// Rendered error chain.
        reason: String,
    },
    /// Reading the host account database failed.
    #[error("account probe failed: {0}")]
    Probe(String),
    /// The worker thread could not be spawned.
    #[error("failed to spawn worker for `{name}`: {reason}")]
    Spawn {
        /// Account name.
        name: String,
        /// OS error text.
        reason: String,
    },
    /// The worker thread is gone and can no longer accept operations.
    #[error("worker for `{0}` has stopped")]
    WorkerGone(String),
}

/// Errors from the core scheduler's topology and cpuset layers.
#[derive(Debug, Error)]
pub enum CoreSchedError {
    /// A topology list could not be parsed.
    #[error("malformed cpu list `{0}`")]
    MalformedList(String),
    /// Filesystem failure with the path involved.
    #[error("{path}: {source}")]
    Io {
        /// File or directory path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the ledger snapshot store.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Filesystem failure.
    #[error("snapshot io error at {path}: {source}")]
    Io {
        /// Snapshot path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The snapshot could not be encoded or decoded.
    #[error("snapshot codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Application-facing result using anyhow for higher-level contexts.
///
/// Backend implementations return this so they can attach whatever context
/// their tooling produces.
pub type AppResult<T> = Result<T, anyhow::Error>;
