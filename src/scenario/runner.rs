//! Scenario runner
//!
//! Runs the auto-sync scenario one step at a time. Each step blocks until
//! its postcondition holds or its bound expires. Every process started
//! along the way is stopped before the report is returned, whatever the
//! outcome.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use colored::Colorize;
use tokio_util::sync::CancellationToken;

use crate::cluster::{
    add_member, find_member_by_client_endpoint, list_members, remove_member, resync_expectation,
    Bootstrap, ClusterNode, ClusterState, InitialCluster,
};
use crate::common::config::Config;
use crate::common::paths::DataDir;
use crate::common::{Error, ErrorKind, Result};
use crate::ctl::{ClientFactory, KeyValue};
use crate::process::{await_pattern, ProcessOutput, ProcessScope};
use crate::retry::RetryPolicy;

use super::config::ScenarioSpec;

/// Steps of the scenario, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    StartSeedNode,
    StartProxy,
    WriteThroughProxy,
    AddJoiningMember,
    StartJoiningNode,
    AwaitProxyResync,
    ResolveSeedMember,
    RemoveSeedMember,
    StopSeedNode,
    ReadThroughProxy,
    VerifyRead,
    Teardown,
}

impl Step {
    pub const ALL: [Step; 12] = [
        Step::StartSeedNode,
        Step::StartProxy,
        Step::WriteThroughProxy,
        Step::AddJoiningMember,
        Step::StartJoiningNode,
        Step::AwaitProxyResync,
        Step::ResolveSeedMember,
        Step::RemoveSeedMember,
        Step::StopSeedNode,
        Step::ReadThroughProxy,
        Step::VerifyRead,
        Step::Teardown,
    ];

    /// 1-based position in the run
    pub fn number(self) -> usize {
        Self::ALL.iter().position(|s| *s == self).unwrap_or(0) + 1
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Step::StartSeedNode => "start seed node as a new cluster",
            Step::StartProxy => "start proxy against the seed node",
            Step::WriteThroughProxy => "write data through the proxy",
            Step::AddJoiningMember => "add joining member",
            Step::StartJoiningNode => "start joining node",
            Step::AwaitProxyResync => "wait for proxy endpoint resync",
            Step::ResolveSeedMember => "resolve seed member id",
            Step::RemoveSeedMember => "remove seed member",
            Step::StopSeedNode => "stop seed node",
            Step::ReadThroughProxy => "read data through the proxy",
            Step::VerifyRead => "verify read",
            Step::Teardown => "stop remaining processes",
        };
        f.write_str(label)
    }
}

/// Result of a scenario run
#[derive(Debug)]
pub struct ScenarioReport {
    pub name: String,
    pub passed: bool,
    pub steps_run: usize,
    pub steps_total: usize,
    pub failed_step: Option<Step>,
    pub error: Option<String>,
    /// Captured output of every started process; filled on failure
    pub process_logs: Vec<ProcessOutput>,
    /// Node data directories left on disk
    pub kept_data_dirs: Vec<PathBuf>,
}

impl ScenarioReport {
    /// Print the failure and the output of every process involved
    pub fn print_failure(&self) {
        let (Some(step), Some(error)) = (self.failed_step, &self.error) else {
            return;
        };
        println!(
            "\n{} {} (step {}: {})",
            "✗".red().bold(),
            "Scenario Failed".red().bold(),
            step.number(),
            step
        );
        println!("  {}", error.red());

        for output in &self.process_logs {
            println!(
                "\n{} {} {}",
                "--- output of".dimmed(),
                output.name.white().bold(),
                format!("({} lines) ---", output.lines.len()).dimmed()
            );
            println!("  $ {}", output.command_line.dimmed());
            for line in &output.lines {
                println!("  {}", line);
            }
        }
    }
}

/// Progress bookkeeping for the step currently running
#[derive(Debug, Default)]
struct Progress {
    current: Option<Step>,
    completed: usize,
}

impl Progress {
    fn begin(&mut self, step: Step) {
        tracing::debug!(step = step.number(), "{}", step);
        self.current = Some(step);
    }

    /// Begin a scenario step unless the run has been cancelled
    fn enter(&mut self, step: Step, cancel: &CancellationToken) -> Result<()> {
        self.begin(step);
        if cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("starting step {}: {}", step.number(), step)));
        }
        Ok(())
    }

    fn done(&mut self, detail: &str) {
        if let Some(step) = self.current.take() {
            self.completed += 1;
            println!(
                "  {} Step {}: {} {}",
                "✓".green(),
                step.number(),
                step,
                detail.dimmed()
            );
        }
    }
}

fn print_failed(step: Step, err: &Error) {
    println!("  {} Step {}: {}: {}", "✗".red(), step.number(), step, err);
}

/// Per-node data directories for one run
struct DataDirs {
    seed: DataDir,
    joining: DataDir,
}

/// Runs a [`ScenarioSpec`] against real processes
pub struct Scenario {
    spec: ScenarioSpec,
    config: Config,
    etcd: PathBuf,
    clients: Arc<dyn ClientFactory>,
    cancel: CancellationToken,
    keep_data: bool,
}

impl Scenario {
    pub fn new(
        spec: ScenarioSpec,
        config: Config,
        etcd: PathBuf,
        clients: Arc<dyn ClientFactory>,
    ) -> Self {
        Self {
            spec,
            config,
            etcd,
            clients,
            cancel: CancellationToken::new(),
            keep_data: false,
        }
    }

    /// Leave node data directories on disk after the run
    pub fn keep_data(mut self, keep: bool) -> Self {
        self.keep_data = keep;
        self
    }

    /// Token that aborts the run when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the scenario and tear everything down
    ///
    /// Step failures are reported through the returned report; `Err` is
    /// only returned when the run could not be set up at all.
    pub async fn run(self) -> Result<ScenarioReport> {
        self.spec.validate()?;

        println!(
            "\n{} {}",
            "Running Scenario:".blue().bold(),
            self.spec.name.white().bold()
        );
        if let Some(desc) = &self.spec.description {
            println!("  {}", desc.dimmed());
        }

        let mut dirs = DataDirs {
            seed: DataDir::create(&self.spec.seed_node.name)?,
            joining: DataDir::create(&self.spec.joining_node.name)?,
        };

        println!("\n{}", "Steps:".cyan());

        let mut scope = ProcessScope::new();
        let mut progress = Progress::default();
        let limit = self.config.timeouts.scenario();

        let outcome = tokio::select! {
            r = self.run_steps(&mut scope, &mut progress, &dirs) => r,
            _ = tokio::time::sleep(limit) => {
                self.cancel.cancel();
                Err(Error::Cancelled(format!(
                    "running past the {}s scenario limit",
                    limit.as_secs()
                )))
            }
        };

        let mut failure = outcome.err().map(|e| {
            let step = progress.current.take().unwrap_or(Step::Teardown);
            print_failed(step, &e);
            (step, e)
        });

        progress.begin(Step::Teardown);
        let stop_failures = scope.release_all().await;
        for (name, err) in &stop_failures {
            tracing::warn!(process = %name, error = %err, "Failed to stop process");
        }
        match stop_failures.into_iter().next() {
            None => progress.done(&format!("({} processes)", scope.len())),
            Some((_, err)) => {
                if failure.is_none() {
                    print_failed(Step::Teardown, &err);
                    failure = Some((Step::Teardown, err));
                }
            }
        }

        let kept_data_dirs = if self.keep_data {
            vec![dirs.seed.keep(), dirs.joining.keep()]
        } else {
            Vec::new()
        };

        let report = match failure {
            None => {
                println!(
                    "\n{} {}\n",
                    "✓".green().bold(),
                    "Scenario Passed".green().bold()
                );
                ScenarioReport {
                    name: self.spec.name.clone(),
                    passed: true,
                    steps_run: progress.completed,
                    steps_total: Step::ALL.len(),
                    failed_step: None,
                    error: None,
                    process_logs: Vec::new(),
                    kept_data_dirs,
                }
            }
            Some((step, err)) => {
                tracing::error!(step = step.number(), error = %err, "Scenario failed");
                ScenarioReport {
                    name: self.spec.name.clone(),
                    passed: false,
                    steps_run: step.number(),
                    steps_total: Step::ALL.len(),
                    failed_step: Some(step),
                    error: Some(err.to_string()),
                    process_logs: scope.outputs(),
                    kept_data_dirs,
                }
            }
        };

        Ok(report)
    }

    async fn run_steps(
        &self,
        scope: &mut ProcessScope,
        progress: &mut Progress,
        dirs: &DataDirs,
    ) -> Result<()> {
        let cancel = &self.cancel;
        let spec = &self.spec;
        let seed = &spec.seed_node;
        let joining = &spec.joining_node;
        let timeouts = &self.config.timeouts;
        let retry = &self.config.retry;

        let bootstrap = Bootstrap {
            etcd: self.etcd.clone(),
            cluster_token: spec.cluster_token.clone(),
            env: self.config.env.clone(),
            ready_timeout: timeouts.node_ready(),
            stop_grace: timeouts.stop_grace(),
        };

        progress.enter(Step::StartSeedNode, cancel)?;
        let seed_node = ClusterNode {
            name: seed.name.clone(),
            data_dir: dirs.seed.path().to_path_buf(),
            client_url: seed.client_url.clone(),
            peer_url: seed.peer_url.clone(),
            state: ClusterState::New,
            initial_cluster: InitialCluster::new().with(&seed.name, &seed.peer_url),
        };
        let seed_proc = bootstrap.start_node(scope, &seed_node, cancel).await?;
        progress.done(&format!("({} at {})", seed.name, seed.client_url));

        progress.enter(Step::StartProxy, cancel)?;
        let proxy = spec.proxy_instance();
        let proxy_proc = bootstrap.start_proxy(scope, &proxy).await?;
        let proxy_conn = self.clients.connect(&proxy.client_endpoints());
        let proxy_client = proxy_conn.as_ref();
        progress.done(&format!("({})", proxy.address));

        progress.enter(Step::WriteThroughProxy, cancel)?;
        let put_policy = RetryPolicy::new(ErrorKind::Unavailable, retry.put_attempts, retry.delay());
        for entry in &spec.data {
            put_policy
                .run("put through proxy", cancel, || {
                    proxy_client.put(&entry.key, &entry.value)
                })
                .await?;
        }
        progress.done(&format!("({} keys)", spec.data.len()));

        progress.enter(Step::AddJoiningMember, cancel)?;
        let seed_conn = self.clients.connect(&[seed.client_url.clone()]);
        let seed_client = seed_conn.as_ref();
        add_member(seed_client, &joining.name, &[joining.peer_url.clone()]).await?;
        progress.done(&format!("({})", joining.name));

        progress.enter(Step::StartJoiningNode, cancel)?;
        let joining_node = ClusterNode {
            name: joining.name.clone(),
            data_dir: dirs.joining.path().to_path_buf(),
            client_url: joining.client_url.clone(),
            peer_url: joining.peer_url.clone(),
            state: ClusterState::Existing,
            initial_cluster: InitialCluster::new()
                .with(&seed.name, &seed.peer_url)
                .with(&joining.name, &joining.peer_url),
        };
        bootstrap.start_node(scope, &joining_node, cancel).await?;
        progress.done(&format!("({} at {})", joining.name, joining.client_url));

        progress.enter(Step::AwaitProxyResync, cancel)?;
        let resync = resync_expectation(&joining.client_url, timeouts.proxy_sync());
        await_pattern(&proxy_proc, &resync, cancel).await?;
        progress.done("");

        progress.enter(Step::ResolveSeedMember, cancel)?;
        let members = list_members(seed_client).await?;
        let seed_id = find_member_by_client_endpoint(&members, &seed.client_url)?;
        progress.done(&format!("({:x})", seed_id));

        progress.enter(Step::RemoveSeedMember, cancel)?;
        let remove_policy = RetryPolicy::new(
            ErrorKind::Unhealthy,
            retry.remove_member_attempts,
            retry.delay(),
        );
        remove_policy
            .run("remove member", cancel, || {
                remove_member(seed_client, seed_id)
            })
            .await?;
        progress.done("");

        progress.enter(Step::StopSeedNode, cancel)?;
        seed_proc.stop().await?;
        progress.done("");

        progress.enter(Step::ReadThroughProxy, cancel)?;
        let read_policy = RetryPolicy::new(
            ErrorKind::LeadershipChanged,
            retry.read_attempts,
            retry.delay(),
        );
        let mut actual: Vec<KeyValue> = Vec::new();
        for entry in &spec.data {
            let kvs = read_policy
                .run("read through proxy", cancel, || proxy_client.get(&entry.key))
                .await?;
            actual.extend(kvs);
        }
        progress.done("");

        progress.enter(Step::VerifyRead, cancel)?;
        actual.sort();
        let expected = spec.expected();
        if actual != expected {
            return Err(Error::assertion(&expected, &actual));
        }
        progress.done(&format!("{:?}", actual));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_numbers() {
        assert_eq!(Step::StartSeedNode.number(), 1);
        assert_eq!(Step::AwaitProxyResync.number(), 6);
        assert_eq!(Step::Teardown.number(), Step::ALL.len());
    }

    #[test]
    fn test_step_labels_are_distinct() {
        let mut labels: Vec<String> = Step::ALL.iter().map(|s| s.to_string()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), Step::ALL.len());
    }
}
