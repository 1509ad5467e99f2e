//! Cluster Configuration and Fragment Routing
//!
//! A blockhouse cluster is described by an ordered list of *epochs*. Each
//! epoch owns an immutable list of *fragments*: half-open key ranges mapped
//! to an owning LTC, a database id, and a set of log-replica StoCs. All
//! routing is relative to the current epoch; advancing an epoch is an
//! immutable replace, so readers snapshot an `Arc<Epoch>` once per request
//! and never observe a half-updated map.

pub mod config;
pub mod fragment;

pub use config::{ClusterConfig, ClusterOptions, ScatterPolicy};
pub use fragment::{Epoch, Fragment, KeyRange};
