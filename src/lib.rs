//! Proxy resync - integration scenarios for an etcd gRPC proxy
//!
//! This library starts real cluster and proxy processes, changes cluster
//! membership underneath the proxy, and checks that the proxy follows the
//! change and keeps serving reads.

pub mod cli;
pub mod cluster;
pub mod commands;
pub mod common;
pub mod ctl;
pub mod process;
pub mod retry;
pub mod scenario;

// Re-export commonly used types for tests
pub use common::{ClusterError, Error, ErrorKind, Result};
pub use scenario::{Scenario, ScenarioReport, ScenarioSpec};
