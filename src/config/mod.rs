//! Configuration models for the ledger, account backends, and cpusets.

pub mod agent;

pub use agent::{AccountsConfig, AgentConfig, CoreSchedConfig, ProbeBackendConfig, TopologyBackendConfig};
