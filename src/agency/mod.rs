//! Agency client
//!
//! - `endpoint`: pool of replica slots with lease/requeue
//! - `failover`: redirect following and endpoint rotation
//! - `client`: primitive key operations
//! - `lock`, `uniqid`, `bootstrap`: coordination built on CAS
//! - `memory`: in-process store for tests and local runs

pub mod bootstrap;
pub mod client;
pub mod endpoint;
pub mod failover;
pub mod lock;
pub mod memory;
pub mod node;
pub mod result;
pub mod transport;
pub mod uniqid;

pub use client::{AgencyClient, CasCondition, AGENCY_URL_PREFIX};
pub use endpoint::{EndpointLease, EndpointPool};
pub use failover::FailoverDriver;
pub use lock::{LockScope, LockType};
pub use memory::InMemoryAgency;
pub use node::Node;
pub use result::{AgencyCommResult, AgencyEntry};
pub use transport::{AgencyRequest, HttpTransport, Transport, TransportResponse};
