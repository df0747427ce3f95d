//! Tests for configuration validation

use std::collections::HashMap;
use std::path::PathBuf;

use sliver_agent::config::{AgentConfig, ProbeBackendConfig, TopologyBackendConfig};

#[test]
fn test_default_config_is_valid() {
    let cfg = AgentConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.accounts.kinds().count(), 5);
    assert_eq!(cfg.accounts.probe, ProbeBackendConfig::Passwd);
    assert_eq!(cfg.coresched.topology, TopologyBackendConfig::Sysfs);
}

#[test]
fn test_small_worker_stack_rejected() {
    let mut cfg = AgentConfig::default();
    cfg.accounts.worker_stack_size = 4096;
    let err = cfg.validate().unwrap_err();
    assert!(err.starts_with("accounts invalid"), "{err}");
}

#[test]
fn test_zero_outcome_history_rejected() {
    let mut cfg = AgentConfig::default();
    cfg.accounts.outcome_history = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_unknown_account_type_rejected() {
    let mut cfg = AgentConfig::default();
    cfg.accounts.shells.insert("sliver.Docker".to_string(), "/bin/dsh".to_string());
    assert!(cfg.validate().is_err());
}

#[test]
fn test_shared_shell_rejected() {
    let mut cfg = AgentConfig::default();
    cfg.accounts.shells.insert("sliver.LXC".to_string(), "/bin/vsh".to_string());
    assert!(cfg.validate().is_err());
}

#[test]
fn test_relative_shell_rejected() {
    let mut cfg = AgentConfig::default();
    cfg.accounts.shells.insert("sliver.LXC".to_string(), "bash".to_string());
    assert!(cfg.validate().is_err());
}

#[test]
fn test_defaults_dir_under_cpuset_root_rejected() {
    let mut cfg = AgentConfig::default();
    cfg.coresched.defaults_dir = cfg.coresched.cpuset_root.join("defaults");
    assert!(cfg.validate().is_err());

    cfg.coresched.enabled = false;
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_empty_core_attribute_rejected() {
    let mut cfg = AgentConfig::default();
    cfg.coresched.core_attribute = "  ".to_string();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_from_json_partial_document() {
    let cfg = AgentConfig::from_json_str(
        r#"{
            "snapshot_path": null,
            "accounts": { "probe": "in_memory", "shells": { "sliver.LXC": "/bin/bash" } },
            "coresched": { "topology": "flat", "core_attribute": "cores" }
        }"#,
    )
    .unwrap();
    assert!(cfg.snapshot_path.is_none());
    assert_eq!(cfg.accounts.probe, ProbeBackendConfig::InMemory);
    assert_eq!(cfg.accounts.kinds().count(), 1);
    assert_eq!(cfg.coresched.topology, TopologyBackendConfig::Flat);
    assert_eq!(cfg.coresched.core_attribute, "cores");
    assert!(cfg.coresched.enabled);
}

#[test]
fn test_from_json_rejects_garbage() {
    assert!(AgentConfig::from_json_str("{ not json").is_err());
    assert!(AgentConfig::from_json_str(r#"{"accounts": {"shells": {}}}"#).is_err());
}

#[test]
fn test_env_overrides() {
    let vars: HashMap<&str, &str> = HashMap::from([
        ("SLIVER_SNAPSHOT_PATH", "/tmp/ledger.json"),
        ("SLIVER_WORKER_STACK_SIZE", "131072"),
        ("SLIVER_CORESCHED_ENABLED", "false"),
        ("SLIVER_CORE_ATTRIBUTE", "dedicated"),
        ("SLIVER_LOG", "sliver_agent=debug"),
    ]);
    let mut cfg = AgentConfig::default();
    cfg.apply_overrides(|key| vars.get(key).map(|v| (*v).to_string()))
        .unwrap();

    assert_eq!(cfg.snapshot_path, Some(PathBuf::from("/tmp/ledger.json")));
    assert_eq!(cfg.accounts.worker_stack_size, 131_072);
    assert!(!cfg.coresched.enabled);
    assert_eq!(cfg.coresched.core_attribute, "dedicated");
    assert_eq!(cfg.log_filter.as_deref(), Some("sliver_agent=debug"));
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_bad_log_filter_rejected() {
    let mut cfg = AgentConfig::default();
    cfg.log_filter = Some("sliver_agent=loud".into());
    let err = cfg.validate().unwrap_err();
    assert!(err.contains("log filter"), "{err}");
}

#[test]
fn test_env_override_disables_snapshot() {
    let mut cfg = AgentConfig::default();
    cfg.apply_overrides(|key| (key == "SLIVER_SNAPSHOT_PATH").then(|| "none".to_string()))
        .unwrap();
    assert!(cfg.snapshot_path.is_none());
}

#[test]
fn test_env_override_rejects_bad_number() {
    let mut cfg = AgentConfig::default();
    let err = cfg
        .apply_overrides(|key| (key == "SLIVER_OUTCOME_HISTORY").then(|| "lots".to_string()))
        .unwrap_err();
    assert!(err.contains("SLIVER_OUTCOME_HISTORY"), "{err}");
}
