//! Cluster nodes, the proxy, and membership changes

pub mod membership;
pub mod node;
pub mod proxy;

pub use membership::{add_member, find_member_by_client_endpoint, list_members, remove_member};
pub use node::{Bootstrap, ClusterNode, ClusterState, InitialCluster, READY_PHRASE};
pub use proxy::{go_duration, resync_expectation, ProxyInstance, RESYNC_MARKER};
