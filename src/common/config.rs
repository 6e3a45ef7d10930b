//! Configuration file handling

use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::paths::config_path;
use super::{Error, Result};

/// Main configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Locations of the external binaries
    #[serde(default)]
    pub binaries: Binaries,

    /// Timeout settings
    #[serde(default)]
    pub timeouts: Timeouts,

    /// Retry settings for transient cluster errors
    #[serde(default)]
    pub retry: RetryConfig,

    /// Extra environment for every spawned process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Paths to the etcd server and etcdctl binaries
///
/// Unset entries are looked up in PATH.
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Binaries {
    pub etcd: Option<PathBuf>,
    pub etcdctl: Option<PathBuf>,
}

impl Binaries {
    /// Resolve the etcd server binary
    pub fn etcd(&self) -> Result<PathBuf> {
        resolve_binary("etcd", self.etcd.as_deref())
    }

    /// Resolve the etcdctl binary
    pub fn etcdctl(&self) -> Result<PathBuf> {
        resolve_binary("etcdctl", self.etcdctl.as_deref())
    }
}

fn resolve_binary(name: &str, configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(Error::BinaryNotFound {
                name: path.display().to_string(),
            })
        };
    }

    which::which(name).map_err(|_| Error::BinaryNotFound {
        name: name.to_string(),
    })
}

/// Timeout settings in seconds
#[derive(Debug, Deserialize, Clone)]
pub struct Timeouts {
    /// How long a node may take to report it is serving clients
    #[serde(default = "default_node_ready")]
    pub node_ready_secs: u64,

    /// How long to wait for the proxy to log an endpoint resync
    #[serde(default = "default_proxy_sync")]
    pub proxy_sync_secs: u64,

    /// Bound on a single control-plane command
    #[serde(default = "default_command")]
    pub command_secs: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Bound on the whole scenario
    #[serde(default = "default_scenario")]
    pub scenario_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            node_ready_secs: default_node_ready(),
            proxy_sync_secs: default_proxy_sync(),
            command_secs: default_command(),
            stop_grace_secs: default_stop_grace(),
            scenario_secs: default_scenario(),
        }
    }
}

impl Timeouts {
    pub fn node_ready(&self) -> Duration {
        Duration::from_secs(self.node_ready_secs)
    }

    pub fn proxy_sync(&self) -> Duration {
        Duration::from_secs(self.proxy_sync_secs)
    }

    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn scenario(&self) -> Duration {
        Duration::from_secs(self.scenario_secs)
    }
}

fn default_node_ready() -> u64 {
    30
}
fn default_proxy_sync() -> u64 {
    5
}
fn default_command() -> u64 {
    10
}
fn default_stop_grace() -> u64 {
    5
}
fn default_scenario() -> u64 {
    120
}

/// Retry settings
#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    /// Attempts for removing a member while the new one turns healthy
    #[serde(default = "default_attempts")]
    pub remove_member_attempts: u32,

    /// Attempts for reading through the proxy during leader election
    #[serde(default = "default_attempts")]
    pub read_attempts: u32,

    /// Attempts for the first write while the proxy comes up
    #[serde(default = "default_attempts")]
    pub put_attempts: u32,

    /// Fixed delay between attempts
    #[serde(default = "default_delay")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            remove_member_attempts: default_attempts(),
            read_attempts: default_attempts(),
            put_attempts: default_attempts(),
            delay_ms: default_delay(),
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

fn default_attempts() -> u32 {
    10
}
fn default_delay() -> u64 {
    500
}

impl Config {
    /// Load configuration from the default config file
    ///
    /// Returns default configuration if file doesn't exist
    pub fn load() -> Result<Self> {
        if let Some(path) = config_path() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::FileRead {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))?;

        let retry = &config.retry;
        if retry.remove_member_attempts == 0 || retry.read_attempts == 0 || retry.put_attempts == 0
        {
            return Err(Error::Config(
                "retry attempt counts must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }
}
