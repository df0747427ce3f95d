//! Integration tests for per-account workers
//!
//! These tests validate:
//! - Replacing an account whose kind changed (destroy before create)
//! - Node-wide serialization of create and destroy
//! - Per-account FIFO order with parallelism across accounts
//! - Panicking backends reported as failed outcomes
//! - Async waiting on operation handles

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sliver_agent::core::{
    AccountBackend, AccountError, AccountKind, AccountProvider, AccountRegistry, AppResult, BackendTable,
    InMemoryOutcomeSink, OpHandle, OpKind, Record, WaitError,
};
use sliver_agent::infra::InMemoryHost;

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn registry(host: &Arc<InMemoryHost>) -> AccountRegistry {
    let backends = BackendTable::new(host.clone())
        .with_provider(host.provider(AccountKind::VServer, "/bin/vsh"))
        .with_provider(host.provider(AccountKind::Lxc, "/bin/bash"));
    AccountRegistry::new(backends)
}

fn ops_of(host: &InMemoryHost, account: &str) -> Vec<(AccountKind, &'static str)> {
    host.calls_for(account).iter().map(|c| (c.kind, c.op)).collect()
}

/// Provider whose accounts panic on configure.
struct PanickingProvider {
    host: Arc<InMemoryHost>,
    configured: Arc<AtomicUsize>,
}

struct PanickingBackend {
    configured: Arc<AtomicUsize>,
}

impl AccountProvider for PanickingProvider {
    fn kind(&self) -> AccountKind {
        AccountKind::Libvirt
    }

    fn shell(&self) -> &str {
        "/bin/sh"
    }

    fn create(&self, name: &str, _variant_hint: Option<&str>) -> AppResult<()> {
        self.host.add_account(name, "/bin/sh");
        Ok(())
    }

    fn destroy(&self, _name: &str) -> AppResult<()> {
        Ok(())
    }

    fn instantiate(&self, _name: &str) -> Box<dyn AccountBackend> {
        Box::new(PanickingBackend {
            configured: Arc::clone(&self.configured),
        })
    }
}

impl AccountBackend for PanickingBackend {
    fn configure(&mut self, _rec: &Record) -> AppResult<()> {
        if self.configured.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("hypervisor connection lost");
        }
        Ok(())
    }

    fn start(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn stop(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn is_running(&self) -> AppResult<bool> {
        Ok(false)
    }
}

// ============================================================================
// ACCOUNT LIFECYCLE
// ============================================================================

#[test]
fn test_kind_change_destroys_before_create() {
    let host = Arc::new(InMemoryHost::new());
    host.add_account("pl_alpha", "/bin/vsh");
    let registry = registry(&host);
    let worker = registry.get("pl_alpha").unwrap();

    let rec = Record::new("pl_alpha", "sliver.LXC", 1).with_attribute("vref", "fedora-39");
    let outcome = worker.ensure_created(&rec).wait(WAIT).unwrap();
    assert!(outcome.is_ok(), "{outcome:?}");

    assert_eq!(
        ops_of(&host, "pl_alpha"),
        vec![
            (AccountKind::VServer, "destroy"),
            (AccountKind::Lxc, "create"),
            (AccountKind::Lxc, "configure"),
            (AccountKind::Lxc, "start"),
        ]
    );
    assert_eq!(host.shell("pl_alpha").as_deref(), Some("/bin/bash"));
    assert_eq!(host.variant("pl_alpha").as_deref(), Some("fedora-39"));
    assert_eq!(host.last_configured("pl_alpha"), Some(rec));
}

#[test]
fn test_unknown_type_and_unregistered_kind() {
    let host = Arc::new(InMemoryHost::new());
    let registry = registry(&host);
    let worker = registry.get("pl_alpha").unwrap();

    let unknown = worker
        .ensure_created(&Record::new("pl_alpha", "sliver.Docker", 1))
        .wait(WAIT)
        .unwrap();
    assert_eq!(unknown.result, Err(AccountError::UnknownType("sliver.Docker".into())));

    let unregistered = worker
        .ensure_created(&Record::new("pl_alpha", "sliver.LIBVIRT", 1))
        .wait(WAIT)
        .unwrap();
    assert!(matches!(unregistered.result, Err(AccountError::Unregistered(_))));
    assert!(host.calls().is_empty());
}

#[test]
fn test_unmanaged_account_left_alone() {
    let host = Arc::new(InMemoryHost::new());
    host.add_account("pl_alpha", "/bin/zsh");
    let registry = registry(&host);
    let worker = registry.get("pl_alpha").unwrap();

    let outcome = worker
        .ensure_created(&Record::new("pl_alpha", "sliver.LXC", 1))
        .wait(WAIT)
        .unwrap();
    assert!(matches!(outcome.result, Err(AccountError::UnmanagedShell { .. })));
    assert_eq!(host.shell("pl_alpha").as_deref(), Some("/bin/zsh"));
}

#[test]
fn test_probe_failure_reported() {
    let host = Arc::new(InMemoryHost::new());
    host.set_probe_broken(true);
    let registry = registry(&host);
    let outcome = registry
        .get("pl_alpha")
        .unwrap()
        .ensure_destroyed()
        .wait(WAIT)
        .unwrap();
    assert!(matches!(outcome.result, Err(AccountError::Probe(_))));
}

#[test]
fn test_destroy_missing_account_succeeds() {
    let host = Arc::new(InMemoryHost::new());
    let registry = registry(&host);
    let outcome = registry
        .get("pl_ghost")
        .unwrap()
        .ensure_destroyed()
        .wait(WAIT)
        .unwrap();
    assert!(outcome.is_ok());
    assert!(host.calls().is_empty());
}

#[test]
fn test_panicking_backend_becomes_failed_outcome() {
    let host = Arc::new(InMemoryHost::new());
    let configured = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(PanickingProvider {
        host: Arc::clone(&host),
        configured: Arc::clone(&configured),
    });
    let sink = Arc::new(InMemoryOutcomeSink::new(16));
    let registry = AccountRegistry::new(BackendTable::new(host.clone()).with_provider(provider))
        .with_outcome_sink(sink.clone());
    let worker = registry.get("pl_vm").unwrap();
    let rec = Record::new("pl_vm", "sliver.LIBVIRT", 1);

    let first = worker.ensure_created(&rec).wait(WAIT).unwrap();
    match &first.result {
        Err(AccountError::Backend { op, reason, .. }) => {
            assert_eq!(*op, "ensure_created");
            assert!(reason.contains("hypervisor connection lost"));
        }
        other => panic!("unexpected result {other:?}"),
    }

    let second = worker.ensure_created(&rec).wait(WAIT).unwrap();
    assert!(second.is_ok(), "{second:?}");
    assert_eq!(configured.load(Ordering::SeqCst), 2);
    assert_eq!(sink.failures().len(), 1);
}

// ============================================================================
// ORDERING AND CONCURRENCY
// ============================================================================

#[test]
fn test_operations_run_in_submission_order() {
    let host = Arc::new(InMemoryHost::new());
    let registry = registry(&host);
    let worker = registry.get("pl_alpha").unwrap();
    let rec = Record::new("pl_alpha", "sliver.LXC", 1);

    let handles = vec![
        worker.ensure_created(&rec),
        worker.stop(),
        worker.start(),
        worker.ensure_destroyed(),
    ];
    let ids: Vec<u64> = handles.iter().map(|h| h.id()).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);

    let outcomes: Vec<OpKind> = handles
        .into_iter()
        .map(|h| h.wait(WAIT).unwrap())
        .inspect(|o| assert!(o.is_ok(), "{o:?}"))
        .map(|o| o.op)
        .collect();
    assert_eq!(
        outcomes,
        vec![OpKind::EnsureCreated, OpKind::Stop, OpKind::Start, OpKind::EnsureDestroyed]
    );
    let ops: Vec<&str> = ops_of(&host, "pl_alpha").into_iter().map(|(_, op)| op).collect();
    assert_eq!(ops, vec!["create", "configure", "start", "stop", "start", "destroy"]);
    assert!(!host.has_account("pl_alpha"));
}

#[test]
fn test_concurrent_submitters_share_one_order() {
    let host = Arc::new(InMemoryHost::new().with_op_delay(Duration::from_millis(5)));
    host.add_account("pl_alpha", "/bin/bash");
    let registry = registry(&host);
    let worker = registry.get("pl_alpha").unwrap();
    let rec = Record::new("pl_alpha", "sliver.LXC", 1);

    let pairs: Vec<(OpHandle, OpHandle)> = thread::scope(|scope| {
        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let worker = Arc::clone(&worker);
                let rec = rec.clone();
                scope.spawn(move || {
                    let destroyed = worker.ensure_destroyed();
                    let created = worker.ensure_created(&rec);
                    (destroyed, created)
                })
            })
            .collect();
        submitters.into_iter().map(|s| s.join().unwrap()).collect()
    });

    let mut last_id = 0;
    for (destroyed, created) in pairs {
        assert!(destroyed.id() < created.id());
        last_id = last_id.max(created.id());
        assert!(destroyed.wait(WAIT).unwrap().is_ok());
        assert!(created.wait(WAIT).unwrap().is_ok());
    }
    assert_eq!(last_id, 7);

    assert_eq!(host.max_concurrent_on("pl_alpha"), 1);
    let structural: Vec<&str> = ops_of(&host, "pl_alpha")
        .into_iter()
        .map(|(_, op)| op)
        .filter(|op| *op == "create" || *op == "destroy")
        .collect();
    assert_eq!(structural.first(), Some(&"destroy"));
    assert_eq!(structural.last(), Some(&"create"));
    assert!(structural.windows(2).all(|w| w[0] != w[1]), "{structural:?}");
    assert!(host.has_account("pl_alpha"));
}

#[test]
fn test_creates_serialized_across_accounts() {
    let host = Arc::new(InMemoryHost::new().with_op_delay(Duration::from_millis(20)));
    let registry = registry(&host);

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let name = format!("pl_{i}");
            registry
                .get(&name)
                .unwrap()
                .ensure_created(&Record::new(name.as_str(), "sliver.LXC", 1))
        })
        .collect();
    for handle in handles {
        assert!(handle.wait(WAIT).unwrap().is_ok());
    }

    assert_eq!(host.max_concurrent("create"), 1);
    assert!(host.max_concurrent("configure") >= 1);
}

#[test]
fn test_accounts_progress_in_parallel() {
    let host = Arc::new(InMemoryHost::new().with_op_delay(Duration::from_millis(50)));
    for i in 0..4 {
        host.add_account(&format!("pl_{i}"), "/bin/bash");
    }
    let registry = registry(&host);

    let started = Instant::now();
    let handles: Vec<_> = (0..4)
        .map(|i| registry.get(&format!("pl_{i}")).unwrap().stop())
        .collect();
    for handle in handles {
        assert!(handle.wait(WAIT).unwrap().is_ok());
    }

    assert!(host.max_concurrent("stop") > 1);
    assert!(started.elapsed() < Duration::from_millis(4 * 50 + 500));
    assert_eq!(registry.worker_names(), vec!["pl_0", "pl_1", "pl_2", "pl_3"]);
}

#[test]
fn test_wait_timeout_keeps_operation_running() {
    let host = Arc::new(InMemoryHost::new().with_op_delay(Duration::from_millis(200)));
    let registry = registry(&host);
    let worker = registry.get("pl_slow").unwrap();

    let handle = worker.ensure_created(&Record::new("pl_slow", "sliver.LXC", 1));
    assert!(matches!(handle.try_outcome(), Ok(None)));
    assert_eq!(handle.wait(Duration::from_millis(10)).unwrap_err(), WaitError::Timeout);

    let follow_up = worker.stop().wait(WAIT).unwrap();
    assert!(follow_up.is_ok());
    assert!(host.has_account("pl_slow"));
    assert_eq!(worker.stats().completed, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_async() {
    let host = Arc::new(InMemoryHost::new());
    let registry = registry(&host);
    let worker = registry.get("pl_async").unwrap();

    let outcome = worker
        .ensure_created(&Record::new("pl_async", "sliver.VServer", 1))
        .wait_async(WAIT)
        .await
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(host.shell("pl_async").as_deref(), Some("/bin/vsh"));
}
