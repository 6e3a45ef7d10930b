//! Scenario description
//!
//! Every address the scenario uses comes from here. The default is the
//! two-node auto-sync run; a YAML file can override any part of it.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::cluster::ProxyInstance;
use crate::common::{strip_scheme, Error, Result};
use crate::ctl::KeyValue;

/// A complete scenario loaded from a YAML file
#[derive(Deserialize, Debug, Clone)]
pub struct ScenarioSpec {
    /// Name of the scenario
    #[serde(default = "default_name")]
    pub name: String,
    /// Optional description of what the scenario verifies
    pub description: Option<String>,
    /// Node that forms the initial one-member cluster and is later removed
    #[serde(default = "default_seed_node")]
    pub seed_node: NodeSpec,
    /// Node added while traffic flows through the proxy
    #[serde(default = "default_joining_node")]
    pub joining_node: NodeSpec,
    #[serde(default)]
    pub proxy: ProxySpec,
    /// Token shared by every node of the cluster
    #[serde(default = "default_cluster_token")]
    pub cluster_token: String,
    /// Pairs written before membership changes and read back at the end
    #[serde(default = "default_data")]
    pub data: Vec<DataEntry>,
}

/// Addresses of one cluster node
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub name: String,
    pub client_url: String,
    pub peer_url: String,
}

/// Proxy settings
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    /// Listen and advertise address, without scheme
    #[serde(default = "default_proxy_address")]
    pub address: String,
    #[serde(default = "default_auto_sync")]
    pub auto_sync_interval_ms: u64,
}

impl Default for ProxySpec {
    fn default() -> Self {
        Self {
            address: default_proxy_address(),
            auto_sync_interval_ms: default_auto_sync(),
        }
    }
}

/// A key/value pair to write
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DataEntry {
    pub key: String,
    pub value: String,
}

impl From<&DataEntry> for KeyValue {
    fn from(e: &DataEntry) -> Self {
        KeyValue::new(&e.key, &e.value)
    }
}

fn default_name() -> String {
    "grpc-proxy-auto-sync".to_string()
}

fn default_seed_node() -> NodeSpec {
    NodeSpec {
        name: "node1".to_string(),
        client_url: "http://localhost:12379".to_string(),
        peer_url: "http://localhost:12380".to_string(),
    }
}

fn default_joining_node() -> NodeSpec {
    NodeSpec {
        name: "node2".to_string(),
        client_url: "http://localhost:22379".to_string(),
        peer_url: "http://localhost:22380".to_string(),
    }
}

fn default_proxy_address() -> String {
    "127.0.0.1:32379".to_string()
}

fn default_auto_sync() -> u64 {
    1000
}

fn default_cluster_token() -> String {
    "etcd-cluster".to_string()
}

fn default_data() -> Vec<DataEntry> {
    vec![DataEntry {
        key: "k1".to_string(),
        value: "v1".to_string(),
    }]
}

impl Default for ScenarioSpec {
    fn default() -> Self {
        Self {
            name: default_name(),
            description: Some(
                "Proxy keeps serving reads after its only initial backend leaves the cluster"
                    .to_string(),
            ),
            seed_node: default_seed_node(),
            joining_node: default_joining_node(),
            proxy: ProxySpec::default(),
            cluster_token: default_cluster_token(),
            data: default_data(),
        }
    }
}

/// Port of a `host:port` address or `scheme://host:port` URL
fn port_of(addr: &str) -> Option<&str> {
    let host_port = strip_scheme(addr).split('/').next().unwrap_or_default();
    host_port
        .rsplit_once(':')
        .map(|(_, port)| port)
        .filter(|port| !port.is_empty())
}

impl ScenarioSpec {
    /// Load a scenario from a YAML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read scenario '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }

    /// Parse and validate a scenario from YAML text
    pub fn parse(content: &str) -> Result<Self> {
        let spec: Self = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse scenario: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Reject descriptions that would make nodes share names or ports
    pub fn validate(&self) -> Result<()> {
        if self.seed_node.name == self.joining_node.name {
            return Err(Error::Config(format!(
                "Seed and joining node share the name '{}'",
                self.seed_node.name
            )));
        }

        let urls = [
            &self.seed_node.client_url,
            &self.seed_node.peer_url,
            &self.joining_node.client_url,
            &self.joining_node.peer_url,
        ];
        for (i, a) in urls.iter().enumerate() {
            if urls[i + 1..].contains(a) {
                return Err(Error::Config(format!("URL '{}' is used twice", a)));
            }
        }

        let proxy_port = port_of(&self.proxy.address);
        if let Some(url) = urls.iter().find(|u| port_of(u).is_some() && port_of(u) == proxy_port) {
            return Err(Error::Config(format!(
                "Proxy address '{}' uses the same port as '{}'",
                self.proxy.address, url
            )));
        }

        if self.data.is_empty() {
            return Err(Error::Config(
                "Scenario needs at least one data entry to verify".to_string(),
            ));
        }
        if self.proxy.auto_sync_interval_ms == 0 {
            return Err(Error::Config(
                "proxy.auto_sync_interval_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Proxy started against the seed node only
    pub fn proxy_instance(&self) -> ProxyInstance {
        ProxyInstance {
            address: self.proxy.address.clone(),
            endpoints: vec![self.seed_node.client_url.clone()],
            auto_sync_interval: Duration::from_millis(self.proxy.auto_sync_interval_ms),
        }
    }

    /// Pairs expected back from the final read, in key order
    pub fn expected(&self) -> Vec<KeyValue> {
        let mut kvs: Vec<KeyValue> = self.data.iter().map(KeyValue::from).collect();
        kvs.sort();
        kvs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_seed_scenario() {
        let spec = ScenarioSpec::default();
        spec.validate().unwrap();
        assert_eq!(spec.seed_node.name, "node1");
        assert_eq!(spec.seed_node.client_url, "http://localhost:12379");
        assert_eq!(spec.joining_node.peer_url, "http://localhost:22380");
        assert_eq!(spec.cluster_token, "etcd-cluster");
        assert_eq!(spec.expected(), vec![KeyValue::new("k1", "v1")]);

        let proxy = spec.proxy_instance();
        assert_eq!(proxy.address, "127.0.0.1:32379");
        assert_eq!(proxy.endpoints, vec!["http://localhost:12379"]);
        assert_eq!(proxy.auto_sync_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_yaml_overrides() {
        let spec = ScenarioSpec::parse(
            r#"
name: shifted-ports
seed_node:
  name: a
  client_url: http://localhost:13379
  peer_url: http://localhost:13380
proxy:
  address: 127.0.0.1:33379
data:
  - key: k1
    value: v1
  - key: k0
    value: v0
"#,
        )
        .unwrap();

        assert_eq!(spec.name, "shifted-ports");
        assert_eq!(spec.seed_node.name, "a");
        assert_eq!(spec.joining_node.name, "node2");
        assert_eq!(spec.proxy.auto_sync_interval_ms, 1000);
        assert_eq!(
            spec.expected(),
            vec![KeyValue::new("k0", "v0"), KeyValue::new("k1", "v1")]
        );
    }

    #[test]
    fn test_rejects_shared_ports() {
        let err = ScenarioSpec::parse(
            r#"
joining_node:
  name: node2
  client_url: http://localhost:12379
  peer_url: http://localhost:22380
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("used twice"));
    }

    #[test]
    fn test_rejects_proxy_on_node_port() {
        for address in ["127.0.0.1:12379", "localhost:22380"] {
            let yaml = format!("proxy:\n  address: {}\n", address);
            let err = ScenarioSpec::parse(&yaml).unwrap_err();
            assert!(err.to_string().contains("same port"), "{}", err);
        }
        ScenarioSpec::parse("proxy:\n  address: 127.0.0.1:42379\n").unwrap();
    }

    #[test]
    fn test_port_of() {
        assert_eq!(port_of("http://localhost:12379"), Some("12379"));
        assert_eq!(port_of("127.0.0.1:32379"), Some("32379"));
        assert_eq!(port_of("http://localhost:2379/"), Some("2379"));
        assert_eq!(port_of("localhost"), None);
    }

    #[test]
    fn test_rejects_same_names() {
        let err = ScenarioSpec::parse(
            r#"
joining_node:
  name: node1
  client_url: http://localhost:22379
  peer_url: http://localhost:22380
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
