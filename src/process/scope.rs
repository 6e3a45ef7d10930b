//! Guaranteed teardown of every process a scenario started
//!
//! Processes are registered as soon as they are spawned and released in
//! reverse order. Release must be awaited explicitly on every exit path;
//! `kill_on_drop` on the child is the backstop if a panic skips it.

use std::sync::Arc;

use crate::common::Error;

use super::handle::ProcessHandle;

/// Captured output of one process, for failure reports
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub name: String,
    pub command_line: String,
    pub lines: Vec<String>,
}

/// Ordered set of processes owned by a scenario
#[derive(Debug, Default)]
pub struct ProcessScope {
    processes: Vec<Arc<ProcessHandle>>,
}

impl ProcessScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a freshly spawned process
    pub fn adopt(&mut self, handle: ProcessHandle) -> Arc<ProcessHandle> {
        let handle = Arc::new(handle);
        self.processes.push(handle.clone());
        handle
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Stop every process, newest first
    ///
    /// Keeps going past failures and returns them; handles stay registered
    /// so their output can still be reported.
    pub async fn release_all(&self) -> Vec<(String, Error)> {
        let mut failures = Vec::new();
        for handle in self.processes.iter().rev() {
            if let Err(e) = handle.stop().await {
                tracing::warn!(process = %handle.name(), error = %e, "Failed to stop process");
                failures.push((handle.name().to_string(), e));
            }
        }
        failures
    }

    /// Output captured from every registered process
    pub fn outputs(&self) -> Vec<ProcessOutput> {
        self.processes
            .iter()
            .map(|h| ProcessOutput {
                name: h.name().to_string(),
                command_line: h.command_line().to_string(),
                lines: h.output(),
            })
            .collect()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::handle::{spawn, ProcessSpec};
    use std::time::Duration;

    #[tokio::test]
    async fn test_release_stops_everything() {
        let mut scope = ProcessScope::new();
        let mut handles = Vec::new();
        for name in ["first", "second", "third"] {
            let spec = ProcessSpec::new(name, "sh").args(["-c", "echo up; sleep 30"]);
            handles.push(scope.adopt(spawn(&spec, Duration::from_secs(2)).await.unwrap()));
        }

        // A process stopped mid-scenario must not trip the final release
        handles[0].stop().await.unwrap();

        let failures = scope.release_all().await;
        assert!(failures.is_empty());
        for handle in &handles {
            assert!(!handle.is_alive().await);
        }

        let names: Vec<String> = scope.outputs().into_iter().map(|o| o.name).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }
}
