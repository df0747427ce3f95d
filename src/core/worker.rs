//! Per-account worker threads.
//!
//! Each account gets one dedicated OS thread that drains a FIFO of operations
//! and drives the account's backend through them one at a time. Callers get an
//! [`OpHandle`] back immediately and may wait on it, poll it, or drop it.
//!
//! # Design Principles
//!
//! - **Strict per-account order**: one thread, one queue, no reordering
//! - **No polling**: workers block on channel recv; handles block on a reply channel
//! - **Failures are values**: a failed or panicking backend call becomes an
//!   [`OpOutcome`] with an error and the worker moves on to the next operation
//! - **Node-wide structural exclusion**: create and destroy run under
//!   [`StructuralPermits`] shared by every worker

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::core::account::{AccountBackend, AccountKind, BackendTable};
use crate::core::audit::OutcomeSink;
use crate::core::{AccountError, Record};
use crate::util::clock::now_ms;

/// Operation kinds a worker accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Make the account exist with the right kind and configuration.
    EnsureCreated,
    /// Make the account not exist.
    EnsureDestroyed,
    /// Start the account's workload.
    Start,
    /// Stop the account's workload.
    Stop,
}

impl OpKind {
    /// Stable name used in logs and errors.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EnsureCreated => "ensure_created",
            Self::EnsureDestroyed => "ensure_destroyed",
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queued operation payload. `EnsureCreated` owns a private copy of the record
/// so later ledger mutation cannot affect queued work.
enum AccountOp {
    EnsureCreated(Box<Record>),
    EnsureDestroyed,
    Start,
    Stop,
}

impl AccountOp {
    const fn kind(&self) -> OpKind {
        match self {
            Self::EnsureCreated(_) => OpKind::EnsureCreated,
            Self::EnsureDestroyed => OpKind::EnsureDestroyed,
            Self::Start => OpKind::Start,
            Self::Stop => OpKind::Stop,
        }
    }
}

struct QueuedOp {
    op_id: u64,
    op: AccountOp,
    reply: Sender<OpOutcome>,
}

/// Result of one finished account operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpOutcome {
    /// Per-worker operation id, in submission order.
    pub op_id: u64,
    /// Account the operation ran against.
    pub account: String,
    /// Operation kind.
    pub op: OpKind,
    /// `Ok` or the failure the backend reported.
    pub result: Result<(), AccountError>,
    /// Completion time in epoch milliseconds.
    pub finished_at_ms: u128,
}

impl OpOutcome {
    /// Whether the operation succeeded.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Errors waiting on an [`OpHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The outcome did not arrive in time; the operation may still run.
    Timeout,
    /// The worker went away without reporting an outcome.
    WorkerGone,
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "operation did not finish in time"),
            Self::WorkerGone => write!(f, "worker stopped before reporting an outcome"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Completion handle for a submitted operation.
///
/// Dropping the handle does not cancel the operation.
#[derive(Debug)]
pub struct OpHandle {
    op_id: u64,
    account: String,
    op: OpKind,
    rx: Receiver<OpOutcome>,
}

impl OpHandle {
    /// Operation id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.op_id
    }

    /// Account the operation targets.
    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Operation kind.
    #[must_use]
    pub const fn op(&self) -> OpKind {
        self.op
    }

    /// Block until the outcome arrives or `timeout` expires.
    ///
    /// # Errors
    ///
    /// `WaitError::Timeout` or `WaitError::WorkerGone`.
    pub fn wait(self, timeout: Duration) -> Result<OpOutcome, WaitError> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => WaitError::Timeout,
            RecvTimeoutError::Disconnected => WaitError::WorkerGone,
        })
    }

    /// Non-blocking check. `Ok(None)` while the operation is queued or running.
    ///
    /// # Errors
    ///
    /// `WaitError::WorkerGone` if the worker dropped the operation.
    pub fn try_outcome(&self) -> Result<Option<OpOutcome>, WaitError> {
        match self.rx.try_recv() {
            Ok(outcome) => Ok(Some(outcome)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(WaitError::WorkerGone),
        }
    }

    /// Await the outcome from an async context.
    ///
    /// The blocking receive runs on tokio's blocking pool so the async runtime
    /// is never stalled.
    ///
    /// # Errors
    ///
    /// `WaitError::Timeout` or `WaitError::WorkerGone`.
    #[cfg(feature = "tokio-runtime")]
    pub async fn wait_async(self, timeout: Duration) -> Result<OpOutcome, WaitError> {
        let rx = self.rx;
        let waited = tokio::time::timeout(timeout, async move {
            tokio::task::spawn_blocking(move || rx.recv().ok())
                .await
                .ok()
                .flatten()
        })
        .await;
        match waited {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => Err(WaitError::WorkerGone),
            Err(_) => Err(WaitError::Timeout),
        }
    }
}

/// Node-wide permits serializing structural backend operations.
///
/// One permit for create, one for destroy; a create and a destroy on different
/// accounts may overlap, two creates may not.
#[derive(Debug, Default)]
pub struct StructuralPermits {
    create: Mutex<()>,
    destroy: Mutex<()>,
}

impl StructuralPermits {
    /// Create a fresh pair of permits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn create(&self) -> MutexGuard<'_, ()> {
        self.create.lock()
    }

    pub(crate) fn destroy(&self) -> MutexGuard<'_, ()> {
        self.destroy.lock()
    }
}

/// Operation counters for one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Operations accepted.
    pub submitted: u64,
    /// Operations that finished successfully.
    pub completed: u64,
    /// Operations that finished with an error.
    pub failed: u64,
}

impl WorkerStats {
    /// Operations still queued or running.
    #[must_use]
    pub const fn in_flight(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed)
            .saturating_sub(self.failed)
    }
}

#[derive(Debug, Default)]
struct WorkerCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl WorkerCounters {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Shared collaborators every worker needs.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub backends: Arc<BackendTable>,
    pub permits: Arc<StructuralPermits>,
    pub sink: Option<Arc<dyn OutcomeSink>>,
    pub stack_size: usize,
}

/// Serial executor for one account.
///
/// Dropping the last reference closes the queue; the thread finishes what is
/// already queued and exits.
pub struct Worker {
    name: String,
    tx: Sender<QueuedOp>,
    /// Next operation id; held across the send so ids follow queue order.
    next_op_id: Mutex<u64>,
    counters: Arc<WorkerCounters>,
}

impl Worker {
    /// Spawn the worker thread for `name`.
    pub(crate) fn spawn(name: &str, ctx: WorkerContext) -> Result<Self, AccountError> {
        let (tx, rx) = unbounded::<QueuedOp>();
        let counters = Arc::new(WorkerCounters::default());
        let thread_counters = Arc::clone(&counters);
        let account = name.to_owned();

        thread::Builder::new()
            .name(format!("acct-{name}"))
            .stack_size(ctx.stack_size)
            .spawn(move || run_worker(&account, &rx, &ctx, &thread_counters))
            .map_err(|e| AccountError::Spawn {
                name: name.to_owned(),
                reason: e.to_string(),
            })?;

        debug!(account = name, "account worker spawned");
        Ok(Self {
            name: name.to_owned(),
            tx,
            next_op_id: Mutex::new(0),
            counters,
        })
    }

    /// Account this worker serves.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue an ensure-created pass for a copy of `rec`.
    pub fn ensure_created(&self, rec: &Record) -> OpHandle {
        self.submit(AccountOp::EnsureCreated(Box::new(rec.clone())))
    }

    /// Queue destruction of the account.
    pub fn ensure_destroyed(&self) -> OpHandle {
        self.submit(AccountOp::EnsureDestroyed)
    }

    /// Queue a start.
    pub fn start(&self) -> OpHandle {
        self.submit(AccountOp::Start)
    }

    /// Queue a stop.
    pub fn stop(&self) -> OpHandle {
        self.submit(AccountOp::Stop)
    }

    /// Current operation counters.
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    fn submit(&self, op: AccountOp) -> OpHandle {
        let mut next_op_id = self.next_op_id.lock();
        let op_id = *next_op_id;
        *next_op_id += 1;
        let kind = op.kind();
        let (reply, rx) = bounded(1);
        let handle = OpHandle {
            op_id,
            account: self.name.clone(),
            op: kind,
            rx,
        };

        let queued = QueuedOp {
            op_id,
            op,
            reply: reply.clone(),
        };
        let sent = self.tx.send(queued);
        drop(next_op_id);
        match sent {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                debug!(account = %self.name, op_id, op = kind.as_str(), "operation queued");
            }
            Err(_) => {
                error!(account = %self.name, op_id, op = kind.as_str(), "worker thread is gone");
                let _ = reply.send(OpOutcome {
                    op_id,
                    account: self.name.clone(),
                    op: kind,
                    result: Err(AccountError::WorkerGone(self.name.clone())),
                    finished_at_ms: now_ms(),
                });
            }
        }
        handle
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn run_worker(
    name: &str,
    rx: &Receiver<QueuedOp>,
    ctx: &WorkerContext,
    counters: &WorkerCounters,
) {
    debug!(account = name, "worker thread started");
    let mut account = AccountDriver {
        name,
        backends: &ctx.backends,
        permits: &ctx.permits,
        cached: None,
    };

    // Blocking recv; exits once every sender is dropped.
    while let Ok(QueuedOp { op_id, op, reply }) = rx.recv() {
        let kind = op.kind();
        debug!(account = name, op_id, op = kind.as_str(), "running operation");

        let result = panic::catch_unwind(AssertUnwindSafe(|| account.apply(op)))
            .unwrap_or_else(|payload| {
                account.cached = None;
                Err(AccountError::Backend {
                    name: name.to_owned(),
                    op: kind.as_str(),
                    reason: panic_message(payload.as_ref()),
                })
            });

        match &result {
            Ok(()) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                info!(account = name, op_id, op = kind.as_str(), "operation finished");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(account = name, op_id, op = kind.as_str(), error = %e, "operation failed");
            }
        }

        let outcome = OpOutcome {
            op_id,
            account: name.to_owned(),
            op: kind,
            result,
            finished_at_ms: now_ms(),
        };
        if let Some(sink) = &ctx.sink {
            sink.record(&outcome);
        }
        // The caller may have dropped its handle.
        let _ = reply.send(outcome);
    }

    debug!(account = name, "worker channel closed, exiting");
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "backend panicked".to_owned())
}

/// Worker-thread-local state machine for one account.
struct AccountDriver<'a> {
    name: &'a str,
    backends: &'a BackendTable,
    permits: &'a StructuralPermits,
    cached: Option<(AccountKind, Box<dyn AccountBackend>)>,
}

impl AccountDriver<'_> {
    fn apply(&mut self, op: AccountOp) -> Result<(), AccountError> {
        match op {
            AccountOp::EnsureCreated(rec) => self.ensure_created(&rec),
            AccountOp::EnsureDestroyed => {
                let current = self.backends.live_kind(self.name)?;
                self.destroy(current)
            }
            AccountOp::Start => {
                let name = self.name;
                self.backend()?.start().map_err(|e| backend_error(name, "start", &e))
            }
            AccountOp::Stop => {
                let name = self.name;
                self.backend()?.stop().map_err(|e| backend_error(name, "stop", &e))
            }
        }
    }

    fn ensure_created(&mut self, rec: &Record) -> Result<(), AccountError> {
        let target = self.backends.target_kind(&rec.account_type)?;
        let current = self.backends.live_kind(self.name)?;
        let recreated = current != Some(target);

        if recreated {
            if let Some(kind) = current {
                info!(account = self.name, from = %kind, to = %target, "account kind changed, replacing");
            }
            self.destroy(current)?;

            let provider = self.backends.provider(target)?;
            let _permit = self.permits.create();
            info!(account = self.name, kind = %target, "creating account");
            provider
                .create(self.name, rec.attribute_str("vref"))
                .map_err(|e| backend_error(self.name, "create", &e))?;
        }

        let name = self.name;
        let backend = self.backend()?;
        backend
            .configure(rec)
            .map_err(|e| backend_error(name, "configure", &e))?;
        if recreated {
            backend.start().map_err(|e| backend_error(name, "start", &e))?;
        }
        Ok(())
    }

    fn destroy(&mut self, current: Option<AccountKind>) -> Result<(), AccountError> {
        self.cached = None;
        let Some(kind) = current else {
            return Ok(());
        };
        let provider = self.backends.provider(kind)?;
        let _permit = self.permits.destroy();
        info!(account = self.name, kind = %kind, "destroying account");
        provider
            .destroy(self.name)
            .map_err(|e| backend_error(self.name, "destroy", &e))
    }

    /// Backend instance for the live kind, rebuilt when the kind changed.
    fn backend(&mut self) -> Result<&mut Box<dyn AccountBackend>, AccountError> {
        let live = self
            .backends
            .live_kind(self.name)?
            .ok_or_else(|| AccountError::Missing(self.name.to_owned()))?;

        if !matches!(&self.cached, Some((kind, _)) if *kind == live) {
            if self.cached.is_some() {
                warn!(account = self.name, kind = %live, "cached backend is stale, refreshing");
            }
            let backend = self.backends.provider(live)?.instantiate(self.name);
            self.cached = Some((live, backend));
        }

        self.cached
            .as_mut()
            .map(|(_, backend)| backend)
            .ok_or_else(|| AccountError::Missing(self.name.to_owned()))
    }
}

fn backend_error(name: &str, op: &'static str, err: &anyhow::Error) -> AccountError {
    AccountError::Backend {
        name: name.to_owned(),
        op,
        reason: format!("{err:#}"),
    }
}
