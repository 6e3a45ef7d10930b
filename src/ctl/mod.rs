//! Control-plane client contract
//!
//! Key reads/writes and membership changes against a node or proxy. Every
//! failure comes back as a [`ClusterError`] whose [`ErrorKind`] callers
//! dispatch on.
//!
//! [`ClusterError`]: crate::common::ClusterError
//! [`ErrorKind`]: crate::common::ErrorKind

pub mod etcdctl;

use std::sync::Arc;

use async_trait::async_trait;

use crate::common::Result;

pub use etcdctl::{EtcdctlClient, EtcdctlFactory};

/// Cluster-assigned member identifier
pub type MemberId = u64;

/// The cluster's bookkeeping entry for one member
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemberRecord {
    pub id: MemberId,
    /// Empty until the member has started for the first time
    pub name: String,
    pub peer_urls: Vec<String>,
    /// Empty until the member has started for the first time
    pub client_urls: Vec<String>,
}

/// A key/value pair as returned by a read
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Client for one set of endpoints
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Endpoints this client talks to
    fn endpoints(&self) -> &[String];

    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Read a key; empty when it does not exist
    async fn get(&self, key: &str) -> Result<Vec<KeyValue>>;

    /// Register a new, not yet started member
    async fn member_add(&self, name: &str, peer_urls: &[String]) -> Result<MemberRecord>;

    async fn member_remove(&self, id: MemberId) -> Result<()>;

    async fn member_list(&self) -> Result<Vec<MemberRecord>>;
}

/// Creates clients for arbitrary endpoint sets
pub trait ClientFactory: Send + Sync {
    fn connect(&self, endpoints: &[String]) -> Arc<dyn ControlPlane>;
}
