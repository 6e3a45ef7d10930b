//! Cluster node bootstrap
//!
//! Builds the etcd command line for a node, launches it and waits until
//! it reports that it is serving client requests.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::common::Result;
use crate::process::{self, await_pattern, LogExpectation, ProcessHandle, ProcessScope, ProcessSpec};

/// Line etcd prints once it accepts client traffic
pub const READY_PHRASE: &str = "ready to serve client requests";

/// How a node joins the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterState {
    /// Form a new cluster from the initial-cluster list
    New,
    /// Join a cluster that already has this node as a member
    Existing,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterState::New => write!(f, "new"),
            ClusterState::Existing => write!(f, "existing"),
        }
    }
}

/// `name=peerURL` pairs handed to a node at launch
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InitialCluster(Vec<(String, String)>);

impl InitialCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, peer_url: impl Into<String>) -> Self {
        self.0.push((name.into(), peer_url.into()));
        self
    }

    pub fn members(&self) -> &[(String, String)] {
        &self.0
    }
}

impl fmt::Display for InitialCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, peer)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", name, peer)?;
        }
        Ok(())
    }
}

/// One etcd member as launched by a scenario
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub name: String,
    /// Exclusively owned by this node
    pub data_dir: PathBuf,
    pub client_url: String,
    pub peer_url: String,
    pub state: ClusterState,
    pub initial_cluster: InitialCluster,
}

impl ClusterNode {
    /// etcd flags for this node
    ///
    /// Client and peer URLs are used both to listen and to advertise.
    pub fn args(&self, cluster_token: &str) -> Vec<String> {
        vec![
            "--name".to_string(),
            self.name.clone(),
            "--data-dir".to_string(),
            self.data_dir.display().to_string(),
            "--listen-client-urls".to_string(),
            self.client_url.clone(),
            "--advertise-client-urls".to_string(),
            self.client_url.clone(),
            "--listen-peer-urls".to_string(),
            self.peer_url.clone(),
            "--initial-advertise-peer-urls".to_string(),
            self.peer_url.clone(),
            "--initial-cluster-token".to_string(),
            cluster_token.to_string(),
            "--initial-cluster-state".to_string(),
            self.state.to_string(),
            "--initial-cluster".to_string(),
            self.initial_cluster.to_string(),
        ]
    }
}

/// Launches nodes and proxies from one etcd binary
#[derive(Debug, Clone)]
pub struct Bootstrap {
    pub etcd: PathBuf,
    pub cluster_token: String,
    pub env: HashMap<String, String>,
    pub ready_timeout: Duration,
    pub stop_grace: Duration,
}

impl Bootstrap {
    /// Start a node and wait until it serves clients
    ///
    /// The process joins `scope` before the wait, so it is torn down even
    /// when it never becomes ready. A node in `existing` mode that has not
    /// been added to the cluster fails here rather than hanging.
    pub async fn start_node(
        &self,
        scope: &mut ProcessScope,
        node: &ClusterNode,
        cancel: &CancellationToken,
    ) -> Result<Arc<ProcessHandle>> {
        let spec = ProcessSpec::new(&node.name, &self.etcd)
            .args(node.args(&self.cluster_token))
            .envs(&self.env);

        tracing::info!(
            node = %node.name,
            state = %node.state,
            initial_cluster = %node.initial_cluster,
            "Starting cluster node"
        );

        let handle = scope.adopt(process::spawn(&spec, self.stop_grace).await?);
        let ready = LogExpectation::phrase(READY_PHRASE, self.ready_timeout);
        await_pattern(&handle, &ready, cancel).await?;

        tracing::info!(node = %node.name, client_url = %node.client_url, "Node is serving clients");
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node2() -> ClusterNode {
        ClusterNode {
            name: "node2".to_string(),
            data_dir: PathBuf::from("/tmp/node2"),
            client_url: "http://localhost:22379".to_string(),
            peer_url: "http://localhost:22380".to_string(),
            state: ClusterState::Existing,
            initial_cluster: InitialCluster::new()
                .with("node1", "http://localhost:12380")
                .with("node2", "http://localhost:22380"),
        }
    }

    #[test]
    fn test_initial_cluster_format() {
        let cluster = InitialCluster::new().with("node1", "http://localhost:12380");
        assert_eq!(cluster.to_string(), "node1=http://localhost:12380");
        assert_eq!(
            node2().initial_cluster.to_string(),
            "node1=http://localhost:12380,node2=http://localhost:22380"
        );
        assert_eq!(InitialCluster::new().to_string(), "");
    }

    #[test]
    fn test_node_args() {
        let args = node2().args("etcd-cluster");
        let expected: Vec<String> = [
            "--name",
            "node2",
            "--data-dir",
            "/tmp/node2",
            "--listen-client-urls",
            "http://localhost:22379",
            "--advertise-client-urls",
            "http://localhost:22379",
            "--listen-peer-urls",
            "http://localhost:22380",
            "--initial-advertise-peer-urls",
            "http://localhost:22380",
            "--initial-cluster-token",
            "etcd-cluster",
            "--initial-cluster-state",
            "existing",
            "--initial-cluster",
            "node1=http://localhost:12380,node2=http://localhost:22380",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(args, expected);
    }

    #[test]
    fn test_cluster_state_yaml() {
        let state: ClusterState = serde_yaml::from_str("existing").unwrap();
        assert_eq!(state, ClusterState::Existing);
    }
}
