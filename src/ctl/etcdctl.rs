//! Control-plane client backed by the `etcdctl` binary
//!
//! Each call runs `etcdctl --endpoints=... -w json <command>` and decodes
//! the JSON it prints. Failures are classified here, from etcdctl's error
//! text, so nothing above this module looks at messages.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use tokio::process::Command;

use crate::common::{ClusterError, Error, ErrorKind, Result};

use super::{ClientFactory, ControlPlane, KeyValue, MemberId, MemberRecord};

/// etcdctl client for a fixed set of endpoints
#[derive(Debug, Clone)]
pub struct EtcdctlClient {
    binary: PathBuf,
    endpoints: Vec<String>,
    timeout: Duration,
    env: HashMap<String, String>,
}

impl EtcdctlClient {
    pub fn new(binary: impl Into<PathBuf>, endpoints: &[String], timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            endpoints: endpoints.to_vec(),
            timeout,
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Run one etcdctl command and return its stdout
    async fn run(&self, args: &[String]) -> Result<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(format!("--endpoints={}", self.endpoints.join(",")))
            .arg(format!("--command-timeout={}s", self.timeout.as_secs().max(1)))
            .arg("-w")
            .arg("json")
            .args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(endpoints = ?self.endpoints, ?args, "etcdctl");

        // Slack on top of etcdctl's own timeout so its error text wins
        let bound = self.timeout + Duration::from_secs(2);
        let output = match tokio::time::timeout(bound, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(Error::spawn(&self.binary.display().to_string(), e)),
            Err(_) => {
                return Err(ClusterError::new(
                    ErrorKind::Unavailable,
                    format!("etcdctl {} timed out after {}s", args.join(" "), bound.as_secs()),
                )
                .into())
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let err = classify_failure(&format!("{}\n{}", stderr, stdout));
        tracing::debug!(kind = %err.kind, message = %err.message, "etcdctl failed");
        Err(err.into())
    }
}

#[async_trait]
impl ControlPlane for EtcdctlClient {
    fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.run(&["put".to_string(), key.to_string(), value.to_string()])
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<KeyValue>> {
        let out = self.run(&["get".to_string(), key.to_string()]).await?;
        parse_get(&out)
    }

    async fn member_add(&self, name: &str, peer_urls: &[String]) -> Result<MemberRecord> {
        let out = self
            .run(&[
                "member".to_string(),
                "add".to_string(),
                name.to_string(),
                format!("--peer-urls={}", peer_urls.join(",")),
            ])
            .await?;
        parse_member_add(&out)
    }

    async fn member_remove(&self, id: MemberId) -> Result<()> {
        self.run(&[
            "member".to_string(),
            "remove".to_string(),
            format!("{:x}", id),
        ])
        .await?;
        Ok(())
    }

    async fn member_list(&self) -> Result<Vec<MemberRecord>> {
        let out = self
            .run(&["member".to_string(), "list".to_string()])
            .await?;
        parse_member_list(&out)
    }
}

/// Builds [`EtcdctlClient`]s sharing one binary, timeout and environment
#[derive(Debug, Clone)]
pub struct EtcdctlFactory {
    binary: PathBuf,
    timeout: Duration,
    env: HashMap<String, String>,
}

impl EtcdctlFactory {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration, env: HashMap<String, String>) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            env,
        }
    }
}

impl ClientFactory for EtcdctlFactory {
    fn connect(&self, endpoints: &[String]) -> Arc<dyn ControlPlane> {
        Arc::new(
            EtcdctlClient::new(&self.binary, endpoints, self.timeout).with_env(self.env.clone()),
        )
    }
}

/// Map etcdctl's error output to a classified error
pub fn classify_failure(output: &str) -> ClusterError {
    let lower = output.to_lowercase();
    let kind = if lower.contains("etcdserver: unhealthy cluster") {
        ErrorKind::Unhealthy
    } else if lower.contains("etcdserver: leader changed") {
        ErrorKind::LeadershipChanged
    } else if lower.contains("connection refused")
        || lower.contains("context deadline exceeded")
        || lower.contains("code = unavailable")
    {
        ErrorKind::Unavailable
    } else {
        ErrorKind::Other
    };

    // etcdctl ends with "Error: <reason>" after any structured warnings
    let message = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .rev()
        .find(|l| l.starts_with("Error:"))
        .or_else(|| output.lines().map(str::trim).filter(|l| !l.is_empty()).last())
        .unwrap_or("etcdctl failed without output")
        .to_string();

    ClusterError::new(kind, message)
}

#[derive(Deserialize)]
struct GetResponse {
    #[serde(default)]
    kvs: Vec<RawKeyValue>,
}

#[derive(Deserialize)]
struct RawKeyValue {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct RawMember {
    #[serde(rename = "ID")]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(default, rename = "peerURLs")]
    peer_urls: Vec<String>,
    #[serde(default, rename = "clientURLs")]
    client_urls: Vec<String>,
}

impl From<RawMember> for MemberRecord {
    fn from(m: RawMember) -> Self {
        Self {
            id: m.id,
            name: m.name,
            peer_urls: m.peer_urls,
            client_urls: m.client_urls,
        }
    }
}

#[derive(Deserialize)]
struct MemberListResponse {
    #[serde(default)]
    members: Vec<RawMember>,
}

#[derive(Deserialize)]
struct MemberAddResponse {
    member: RawMember,
}

fn decode_b64(field: &str, value: &str) -> Result<String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| {
            ClusterError::new(
                ErrorKind::Other,
                format!("etcdctl returned invalid base64 {}: {}", field, e),
            )
        })?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Decode `etcdctl get -w json` output
pub fn parse_get(json: &str) -> Result<Vec<KeyValue>> {
    let resp: GetResponse = serde_json::from_str(json)?;
    resp.kvs
        .into_iter()
        .map(|kv| {
            Ok(KeyValue {
                key: decode_b64("key", &kv.key)?,
                value: decode_b64("value", &kv.value)?,
            })
        })
        .collect()
}

/// Decode `etcdctl member list -w json` output
pub fn parse_member_list(json: &str) -> Result<Vec<MemberRecord>> {
    let resp: MemberListResponse = serde_json::from_str(json)?;
    Ok(resp.members.into_iter().map(Into::into).collect())
}

/// Decode `etcdctl member add -w json` output
pub fn parse_member_add(json: &str) -> Result<MemberRecord> {
    let resp: MemberAddResponse = serde_json::from_str(json)?;
    Ok(resp.member.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        let json = r#"{"header":{"cluster_id":14841639068965178418,"member_id":10276657743932975437,"revision":2,"raft_term":2},"kvs":[{"key":"azE=","create_revision":2,"mod_revision":2,"version":1,"value":"djE="}],"count":1}"#;
        assert_eq!(parse_get(json).unwrap(), vec![KeyValue::new("k1", "v1")]);
    }

    #[test]
    fn test_parse_get_missing_key() {
        let json = r#"{"header":{"cluster_id":1,"member_id":2,"revision":1,"raft_term":2}}"#;
        assert!(parse_get(json).unwrap().is_empty());
    }

    #[test]
    fn test_parse_member_list_with_unstarted_member() {
        let json = r#"{"header":{"cluster_id":1,"member_id":2,"raft_term":2},"members":[
            {"ID":10276657743932975437,"name":"node1","peerURLs":["http://localhost:12380"],"clientURLs":["http://localhost:12379"]},
            {"ID":3920187365429834,"peerURLs":["http://localhost:22380"],"isLearner":false}
        ]}"#;
        let members = parse_member_list(json).unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].id, 10276657743932975437);
        assert_eq!(members[0].client_urls, vec!["http://localhost:12379"]);
        assert_eq!(members[1].name, "");
        assert!(members[1].client_urls.is_empty());
    }

    #[test]
    fn test_parse_member_add() {
        let json = r#"{"header":{"cluster_id":1,"member_id":2,"raft_term":2},"member":{"ID":3920187365429834,"peerURLs":["http://localhost:22380"]},"members":[]}"#;
        let member = parse_member_add(json).unwrap();
        assert_eq!(member.id, 3920187365429834);
        assert_eq!(member.peer_urls, vec!["http://localhost:22380"]);
    }

    #[test]
    fn test_classify_failure() {
        let unhealthy = classify_failure(
            "{\"level\":\"warn\",\"msg\":\"retrying of unary invoker failed\"}\nError: etcdserver: unhealthy cluster\n",
        );
        assert_eq!(unhealthy.kind, ErrorKind::Unhealthy);
        assert_eq!(unhealthy.message, "Error: etcdserver: unhealthy cluster");

        let leader = classify_failure(
            "Error: rpc error: code = Unavailable desc = etcdserver: leader changed",
        );
        assert_eq!(leader.kind, ErrorKind::LeadershipChanged);

        let down = classify_failure("Error: context deadline exceeded");
        assert_eq!(down.kind, ErrorKind::Unavailable);

        let other = classify_failure("Error: etcdserver: member not found");
        assert_eq!(other.kind, ErrorKind::Other);

        let empty = classify_failure("");
        assert_eq!(empty.kind, ErrorKind::Other);
        assert_eq!(empty.message, "etcdctl failed without output");
    }
}
