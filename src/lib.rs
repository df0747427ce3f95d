//! # Sliver Agent
//!
//! Per-host reconciliation engine for sliver accounts.
//!
//! The agent keeps a durable ledger of desired-state records delivered by a
//! central authority, reconciles each sliver's host account through a
//! dedicated per-account worker, and partitions the host's CPUs and NUMA
//! memory nodes among slivers that reserve cores.
//!
//! ## Pieces
//!
//! - **Ledger**: merges timestamped records, applies resource loans to compute
//!   effective rspecs, dispatches changed records to workers, sweeps orphaned
//!   accounts, and persists a snapshot from a background writer thread.
//! - **Workers**: one OS thread per account, processing operations strictly
//!   in order. Creation and destruction are serialized host-wide.
//! - **Core scheduler**: assigns whole cores, preferring hyperthread siblings
//!   and pairing each pick with an unused memory node, then writes cpusets.
//! - **Node API**: the per-sliver calls a node-manager RPC layer forwards to.
//!
//! ```rust,ignore
//! use sliver_agent::builders::build_agent;
//! use sliver_agent::config::AgentConfig;
//!
//! let cfg = AgentConfig::from_env()?;
//! sliver_agent::util::init_tracing_with(cfg.log_filter.as_deref())?;
//! let agent = build_agent(&cfg, |_kind, _shell| Ok(None))?;
//! let (sync, cores) = agent.apply_full_update(records)?;
//! agent.shutdown();
//! ```
//!
//! For complete scenarios, see `tests/ledger_test.rs` and
//! `tests/coresched_test.rs`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Ledger, records, account workers, and core scheduling.
pub mod core;
/// Configuration models for the ledger, account backends, and cpusets.
pub mod config;
/// Builders to construct an agent from configuration.
pub mod builders;
/// Infrastructure adapters: host accounts, snapshots, topology, cgroups.
pub mod infra;
/// Node API surface.
pub mod runtime;
/// Shared utilities.
pub mod util;
