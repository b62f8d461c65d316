//! # agencycomm
//!
//! Client for the Agency, the etcd-v2 style coordination store of a
//! cluster. Provides:
//! - A pool of replica endpoints with lease/requeue semantics
//! - Redirect-following failover across replicas
//! - Key primitives: get, set, remove, compare-and-swap, watch
//! - TTL read/write locks, cluster-wide unique ids
//! - One-time bootstrap of the default namespace
//!
//! ## Architecture
//!
//! ```text
//!  AgencyClient ── lock / uniqid / bootstrap
//!       │
//!  FailoverDriver ── 307 redirects, rotation
//!       │
//!  EndpointPool ──── leases per replica slot
//!       │
//!  Transport ─────── HttpTransport (reqwest) | InMemoryAgency
//! ```
//!
//! ## Usage
//!
//! ```bash
//! agencyctl --endpoint tcp://127.0.0.1:4001 set Plan/Version 1
//! agencyctl --endpoint tcp://127.0.0.1:4001 get Plan --recursive
//! agencyctl --memory init
//! ```

pub mod agency;
pub mod common;

pub use agency::{AgencyClient, AgencyCommResult, CasCondition, LockType};
pub use common::{AgencyConfig, Error, Result};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
