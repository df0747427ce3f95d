//! Tests for the node API surface

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sliver_agent::core::{
    AccountKind, AccountRegistry, BackendTable, Ledger, LedgerError, Loan, OpKind, ResourceValue,
};
use sliver_agent::infra::InMemoryHost;
use sliver_agent::runtime::NodeApi;

const WAIT: Duration = Duration::from_secs(5);

fn api() -> (Arc<InMemoryHost>, NodeApi) {
    let host = Arc::new(InMemoryHost::new());
    let backends = BackendTable::new(host.clone())
        .with_provider(host.provider(AccountKind::Lxc, "/bin/bash"))
        .with_provider(host.provider(AccountKind::Delegate, "/bin/forward_api_calls"));
    let ledger = Ledger::new(Arc::new(AccountRegistry::new(backends)));
    (host, NodeApi::new(Arc::new(ledger)))
}

#[test]
fn test_deliver_json_and_list() {
    let (_host, api) = api();
    let report = api
        .deliver_json(
            &json!([
                {"record_key": "b", "name": "pl_b", "account_type": "sliver.LXC", "timestamp": 3,
                 "rspec": {"cpu_share": 4}, "loans": [], "plc_instantiated": true},
                {"record_key": "a", "name": "pl_a", "account_type": "sliver.LXC", "timestamp": 3,
                 "rspec": {"cpu_share": 8}, "loans": [["pl_b", "cpu_share", 2]], "plc_instantiated": true}
            ])
            .to_string(),
        )
        .unwrap();
    assert_eq!(report.merged, 2);

    let names: Vec<String> = api.list_slivers().into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["pl_a", "pl_b"]);
    assert_eq!(api.get_effective_rspec("pl_b").unwrap()["cpu_share"], ResourceValue::Amount(6));
    assert_eq!(api.get_rspec("pl_b").unwrap()["cpu_share"], ResourceValue::Amount(4));
    assert_eq!(api.get_loans("pl_a").unwrap(), vec![Loan::new("pl_b", "cpu_share", 2)]);
}

#[test]
fn test_deliver_json_stamped_batch_with_fractional_times() {
    let (host, api) = api();
    host.add_account("pl_gone", "/bin/bash");
    let report = api
        .deliver_json(
            &json!({
                "timestamp": 1_700_000_100.5,
                "records": [
                    {"record_key": "pl_a", "name": "pl_a", "account_type": "sliver.LXC",
                     "timestamp": 1_700_000_000.25, "rspec": {}, "loans": [], "plc_instantiated": true},
                    {"record_key": "pl_b", "name": "pl_b", "account_type": "sliver.LXC",
                     "timestamp": 1_700_000_090.75, "rspec": {}, "loans": [], "plc_instantiated": true}
                ]
            })
            .to_string(),
        )
        .unwrap();

    assert_eq!(report.merged, 2);
    assert_eq!(report.purged, 0);
    assert_eq!(report.destroyed, 1);
    assert_eq!(api.ledger().watermark(), 1_700_000_100.5);
    let summaries = api.list_slivers();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0].timestamp, 1_700_000_000.25);
}

#[test]
fn test_deliver_json_rejects_malformed_batch() {
    let (_host, api) = api();
    let err = api.deliver_json(r#"[{"name": "pl_a"}]"#).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidRecord { .. }));
    assert!(api.list_slivers().is_empty());
}

#[test]
fn test_set_loans_validates_shape() {
    let (_host, api) = api();
    api.deliver_json(
        &json!([{"record_key": "pl_a", "name": "pl_a", "account_type": "sliver.LXC", "timestamp": 1,
                 "rspec": {"net_share": 5}, "loans": [], "plc_instantiated": true}])
        .to_string(),
    )
    .unwrap();

    let err = api.set_loans("pl_a", &json!([["pl_b", "disk_max", 1]])).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidLoans(_)));
    assert!(matches!(
        api.set_loans("pl_ghost", &json!([])),
        Err(LedgerError::UnknownSliver(_))
    ));

    api.set_loans("pl_a", &json!([["pl_b", "net_share", 2]])).unwrap();
    assert_eq!(api.get_loans("pl_a").unwrap().len(), 1);
}

#[test]
fn test_create_only_for_delegated_slivers() {
    let (host, api) = api();
    api.deliver_ticket_json(
        &json!([
            {"record_key": "pl_own", "name": "pl_own", "account_type": "sliver.LXC", "timestamp": 1,
             "rspec": {}, "loans": [], "plc_instantiated": true},
            {"record_key": "pl_del", "name": "pl_del", "account_type": "sliver.LXC", "timestamp": 1,
             "rspec": {}, "loans": [], "plc_instantiated": false}
        ])
        .to_string(),
    )
    .unwrap();

    assert!(matches!(api.create("pl_own"), Err(LedgerError::NotDelegated(_))));
    assert!(!host.has_account("pl_del"));
    let outcome = api.create("pl_del").unwrap().wait(WAIT).unwrap();
    assert!(outcome.is_ok());
    assert!(host.has_account("pl_del"));
    assert!(host.is_running("pl_del"));

    let outcome = api.destroy("pl_del").unwrap().wait(WAIT).unwrap();
    assert!(outcome.is_ok());
    assert!(!host.has_account("pl_del"));
}

#[test]
fn test_start_stop_unknown_sliver() {
    let (_host, api) = api();
    assert!(matches!(api.start("pl_ghost"), Err(LedgerError::UnknownSliver(_))));
    assert!(matches!(api.stop("pl_ghost"), Err(LedgerError::UnknownSliver(_))));
}

#[test]
fn test_recreate_runs_four_steps_in_order() {
    let (host, api) = api();
    api.deliver_ticket_json(
        &json!([{"record_key": "pl_a", "name": "pl_a", "account_type": "sliver.LXC", "timestamp": 1,
                 "rspec": {}, "loans": [], "plc_instantiated": true}])
        .to_string(),
    )
    .unwrap();

    let handles = api.recreate("pl_a").unwrap();
    let ops: Vec<OpKind> = handles.iter().map(|h| h.op()).collect();
    assert_eq!(
        ops,
        vec![OpKind::Stop, OpKind::EnsureDestroyed, OpKind::EnsureCreated, OpKind::Start]
    );
    for handle in handles {
        assert!(handle.wait(WAIT).unwrap().is_ok());
    }
    assert!(host.has_account("pl_a"));
    assert!(host.is_running("pl_a"));
    let destroys = host.calls_for("pl_a").iter().filter(|c| c.op == "destroy").count();
    assert_eq!(destroys, 1);
}
