//! Node API surface.

pub mod api;

pub use api::{NodeApi, SliverSummary};
