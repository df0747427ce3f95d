//! Tests for outcome sinks

use std::sync::Arc;
use std::time::Duration;

use sliver_agent::core::{
    AccountKind, AccountRegistry, BackendTable, InMemoryOutcomeSink, OpKind, OutcomeSink, Record,
    TracingOutcomeSink,
};
use sliver_agent::infra::InMemoryHost;

const WAIT: Duration = Duration::from_secs(5);

fn registry_with(sink: Arc<dyn OutcomeSink>) -> (Arc<InMemoryHost>, AccountRegistry) {
    let host = Arc::new(InMemoryHost::new());
    let backends = BackendTable::new(host.clone()).with_provider(host.provider(AccountKind::Lxc, "/bin/bash"));
    (host, AccountRegistry::new(backends).with_outcome_sink(sink))
}

#[test]
fn test_in_memory_sink_records_every_outcome() {
    let sink = Arc::new(InMemoryOutcomeSink::new(10));
    let (_host, registry) = registry_with(sink.clone());
    let worker = registry.get("pl_alpha").unwrap();

    let rec = Record::new("pl_alpha", "sliver.LXC", 1);
    worker.ensure_created(&rec).wait(WAIT).unwrap();
    worker.stop().wait(WAIT).unwrap();

    let outcomes = sink.outcomes();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].op, OpKind::EnsureCreated);
    assert_eq!(outcomes[1].op, OpKind::Stop);
    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert!(sink.failures().is_empty());
}

#[test]
fn test_in_memory_sink_filters_failures_and_accounts() {
    let sink = Arc::new(InMemoryOutcomeSink::new(10));
    let (host, registry) = registry_with(sink.clone());
    host.fail_on("pl_beta", "create");

    let alpha = registry.get("pl_alpha").unwrap();
    let beta = registry.get("pl_beta").unwrap();
    alpha.ensure_created(&Record::new("pl_alpha", "sliver.LXC", 1)).wait(WAIT).unwrap();
    let failed = beta.ensure_created(&Record::new("pl_beta", "sliver.LXC", 1)).wait(WAIT).unwrap();
    assert!(!failed.is_ok());

    assert_eq!(sink.failures().len(), 1);
    assert_eq!(sink.failures()[0].account, "pl_beta");
    assert_eq!(sink.for_account("pl_alpha").len(), 1);
}

#[test]
fn test_tracing_sink_accepts_outcomes() {
    let (_host, registry) = registry_with(Arc::new(TracingOutcomeSink));
    let worker = registry.get("pl_alpha").unwrap();
    let outcome = worker.start().wait(WAIT).unwrap();
    // No account yet, so start fails; the sink only logs it.
    assert!(!outcome.is_ok());
}
