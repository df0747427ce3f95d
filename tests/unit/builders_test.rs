//! Tests for agent builders

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sliver_agent::builders::build_agent;
use sliver_agent::config::{AgentConfig, ProbeBackendConfig, TopologyBackendConfig};
use sliver_agent::core::{AccountKind, AccountProvider, Record};
use sliver_agent::infra::InMemoryHost;

fn in_memory_config() -> AgentConfig {
    let mut cfg = AgentConfig::default();
    cfg.snapshot_path = None;
    cfg.accounts.probe = ProbeBackendConfig::InMemory;
    cfg.coresched.enabled = false;
    cfg
}

#[test]
fn test_build_agent_in_memory() {
    let agent = build_agent(&in_memory_config(), |_, _| Ok(None)).unwrap();
    let host = agent.host.clone().expect("in-memory host");
    assert!(agent.coresched.is_none());
    assert!(agent.ledger.is_empty());

    let (report, cores) = agent
        .apply_full_update(vec![Record::new("pl_alpha", "sliver.LXC", 10)])
        .unwrap();
    assert_eq!(report.merged, 1);
    assert_eq!(report.dispatched, 1);
    assert!(cores.is_none());

    let worker = agent.ledger.registry().get("pl_alpha").unwrap();
    worker.stop().wait(Duration::from_secs(5)).unwrap();
    assert!(host.has_account("pl_alpha"));
    assert_eq!(host.shell("pl_alpha").as_deref(), Some("/bin/bash"));
    agent.shutdown();
}

#[test]
fn test_build_agent_uses_factory_per_kind() {
    let mut cfg = AgentConfig::default();
    cfg.snapshot_path = None;
    cfg.coresched.enabled = false;
    let dir = tempfile::tempdir().unwrap();
    let passwd = dir.path().join("passwd");
    std::fs::write(&passwd, "root:x:0:0:root:/root:/bin/bash\n").unwrap();
    cfg.accounts.passwd_path = passwd;
    cfg.accounts.shells = BTreeMap::from([
        ("sliver.VServer".to_string(), "/bin/vsh".to_string()),
        ("delegate".to_string(), "/bin/forward_api_calls".to_string()),
    ]);

    let backing = Arc::new(InMemoryHost::new());
    let mut asked = Vec::new();
    let agent = build_agent(&cfg, |kind, shell| {
        asked.push(kind);
        Ok((kind == AccountKind::VServer)
            .then(|| backing.provider(kind, shell) as Arc<dyn AccountProvider>))
    })
    .unwrap();

    assert_eq!(asked, vec![AccountKind::Delegate, AccountKind::VServer]);
    assert!(agent.host.is_none());
    let kinds: Vec<AccountKind> = agent.ledger.registry().backends().kinds().collect();
    assert_eq!(kinds, vec![AccountKind::VServer]);
}

#[test]
fn test_build_agent_factory_error_propagates() {
    let mut cfg = in_memory_config();
    cfg.accounts.probe = ProbeBackendConfig::Passwd;
    let err = build_agent(&cfg, |_, _| Err(anyhow::anyhow!("no driver"))).unwrap_err();
    assert!(format!("{err:#}").contains("no driver"));
}

#[test]
fn test_build_agent_rejects_invalid_config() {
    let mut cfg = in_memory_config();
    cfg.accounts.outcome_history = 0;
    assert!(build_agent(&cfg, |_, _| Ok(None)).is_err());
}

#[test]
fn test_build_agent_with_flat_coresched() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = in_memory_config();
    cfg.coresched.enabled = true;
    cfg.coresched.topology = TopologyBackendConfig::Flat;
    cfg.coresched.cpuset_root = dir.path().join("cpuset");
    cfg.coresched.defaults_dir = dir.path().join("defaults");

    let agent = build_agent(&cfg, |_, _| Ok(None)).unwrap();
    let (_, cores) = agent
        .apply_full_update(vec![Record::new("pl_alpha", "sliver.LXC", 1)])
        .unwrap();
    let cores = cores.expect("core report");
    assert!(cores.default_written);
    assert!(cores.written_groups.is_empty());
    assert!(dir.path().join("defaults/cpuset.cpus").exists());
}
