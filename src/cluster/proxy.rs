//! gRPC proxy launcher and its resync signal

use std::sync::Arc;
use std::time::Duration;

use crate::common::{strip_scheme, Result};
use crate::process::{self, LogExpectation, ProcessHandle, ProcessScope, ProcessSpec};

use super::node::Bootstrap;

/// Phrase the proxy logs whenever its backend endpoint set changes
pub const RESYNC_MARKER: &str = "Resolver state updated";

/// A stateless proxy in front of the cluster
#[derive(Debug, Clone)]
pub struct ProxyInstance {
    /// Listen and advertise address, without scheme
    pub address: String,
    /// Backend client endpoints it starts with
    pub endpoints: Vec<String>,
    /// How often it refreshes its endpoints from cluster membership
    pub auto_sync_interval: Duration,
}

impl ProxyInstance {
    /// `etcd grpc-proxy start` arguments
    pub fn args(&self) -> Vec<String> {
        vec![
            "grpc-proxy".to_string(),
            "start".to_string(),
            "--advertise-client-url".to_string(),
            self.address.clone(),
            "--listen-addr".to_string(),
            self.address.clone(),
            "--endpoints".to_string(),
            self.endpoints.join(","),
            "--endpoints-auto-sync-interval".to_string(),
            go_duration(self.auto_sync_interval),
        ]
    }

    /// Client endpoints for talking through the proxy
    pub fn client_endpoints(&self) -> Vec<String> {
        vec![self.address.clone()]
    }
}

/// Expect a resync line that names `endpoint`
///
/// The proxy logs backends without their scheme, so it is stripped first.
pub fn resync_expectation(endpoint: &str, timeout: Duration) -> LogExpectation {
    LogExpectation::phrase(RESYNC_MARKER, timeout).containing(strip_scheme(endpoint))
}

/// Format a duration the way Go's `time.Duration.String` would for
/// whole seconds or milliseconds
pub fn go_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 && d.as_secs() > 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

impl Bootstrap {
    /// Start a proxy
    ///
    /// The proxy prints no reliable readiness line, so this only launches
    /// it; callers retry their first request while it comes up.
    pub async fn start_proxy(
        &self,
        scope: &mut ProcessScope,
        proxy: &ProxyInstance,
    ) -> Result<Arc<ProcessHandle>> {
        let spec = ProcessSpec::new("proxy", &self.etcd)
            .args(proxy.args())
            .envs(&self.env);

        tracing::info!(
            address = %proxy.address,
            endpoints = ?proxy.endpoints,
            auto_sync = %go_duration(proxy.auto_sync_interval),
            "Starting proxy"
        );

        Ok(scope.adopt(process::spawn(&spec, self.stop_grace).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_args() {
        let proxy = ProxyInstance {
            address: "127.0.0.1:32379".to_string(),
            endpoints: vec!["http://localhost:12379".to_string()],
            auto_sync_interval: Duration::from_secs(1),
        };
        assert_eq!(
            proxy.args(),
            vec![
                "grpc-proxy",
                "start",
                "--advertise-client-url",
                "127.0.0.1:32379",
                "--listen-addr",
                "127.0.0.1:32379",
                "--endpoints",
                "http://localhost:12379",
                "--endpoints-auto-sync-interval",
                "1s",
            ]
        );
    }

    #[test]
    fn test_go_duration() {
        assert_eq!(go_duration(Duration::from_secs(1)), "1s");
        assert_eq!(go_duration(Duration::from_secs(90)), "90s");
        assert_eq!(go_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(go_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_resync_expectation() {
        let exp = resync_expectation("http://localhost:22379", Duration::from_secs(5));
        assert!(exp.matches(
            r#"{"level":"info","msg":"Resolver state updated","state":"{Addresses:[{Addr:localhost:12379} {Addr:localhost:22379}]}"}"#
        ));
        assert!(!exp.matches("Resolver state updated: [localhost:12379]"));
        assert!(!exp.matches("dial localhost:22379: connection refused"));
    }
}
