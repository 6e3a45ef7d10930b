//! Child process spawning and termination
//!
//! stdout and stderr are both piped into a single [`OutputLog`], one line
//! at a time, by a pump task that lives as long as the streams stay open.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::common::{Error, Result};

use super::log::OutputLog;

/// How long `stop` waits for the pumps to drain after the process exits
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// What to run
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Short label used in logs and errors (e.g. "node1", "proxy")
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: &HashMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Command line as a single string, for diagnostics
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// A running (or stopped) child process and its captured output
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    command_line: String,
    pid: Option<u32>,
    child: Mutex<Option<Child>>,
    log: Arc<OutputLog>,
    /// Lines before this index were consumed by an earlier successful wait
    consumed: AtomicUsize,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
    stop_grace: Duration,
}

/// Spawn a process and start capturing its output
pub async fn spawn(spec: &ProcessSpec, stop_grace: Duration) -> Result<ProcessHandle> {
    let command_line = spec.command_line();
    tracing::debug!(process = %spec.name, command = %command_line, "Spawning process");

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::spawn(&command_line, e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::spawn(&command_line, "stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::spawn(&command_line, "stderr was not captured"))?;

    let pid = child.id();
    let log = Arc::new(OutputLog::new());

    let pump_log = log.clone();
    let pump_name = spec.name.clone();
    let pump = tokio::spawn(async move {
        tokio::join!(
            pump_lines(stdout, &pump_log, &pump_name),
            pump_lines(stderr, &pump_log, &pump_name),
        );
        pump_log.close();
        tracing::debug!(process = %pump_name, "Output streams closed");
    });

    tracing::info!(process = %spec.name, pid = ?pid, "Process started");

    Ok(ProcessHandle {
        name: spec.name.clone(),
        command_line,
        pid,
        child: Mutex::new(Some(child)),
        log,
        consumed: AtomicUsize::new(0),
        pump: std::sync::Mutex::new(Some(pump)),
        stop_grace,
    })
}

async fn pump_lines<R: AsyncRead + Unpin>(stream: R, log: &OutputLog, name: &str) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::trace!(process = %name, "{}", line);
                log.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(process = %name, error = %e, "Failed to read process output");
                break;
            }
        }
    }
}

impl ProcessHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn log(&self) -> &OutputLog {
        &self.log
    }

    /// Everything the process has written so far
    pub fn output(&self) -> Vec<String> {
        self.log.snapshot()
    }

    pub(crate) fn consumed(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }

    pub(crate) fn consume_through(&self, index: usize) {
        self.consumed.fetch_max(index + 1, Ordering::SeqCst);
    }

    /// Whether the process is still running
    pub async fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminate the process and wait for it to exit
    ///
    /// Sends SIGTERM, then SIGKILL once the grace period has passed. Calling
    /// this on an already stopped handle is a no-op. Output is drained and
    /// the log closed whether or not the exit could be confirmed; when it
    /// could not, the child stays with the handle so a later call retries.
    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        let result = self.terminate_and_wait(&mut child).await;
        if result.is_err() {
            *guard = Some(child);
        }
        drop(guard);

        let pump = self
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(pump) = pump {
            if tokio::time::timeout(DRAIN_TIMEOUT, pump).await.is_err() {
                tracing::debug!(process = %self.name, "Output still open after exit");
            }
        }
        self.log.close();

        result
    }

    async fn terminate_and_wait(&self, child: &mut Child) -> Result<()> {
        if let Ok(Some(status)) = child.try_wait() {
            tracing::debug!(process = %self.name, %status, "Process had already exited");
            return Ok(());
        }

        terminate(child);
        let stop_error = |e: std::io::Error| Error::Stop {
            process: self.name.clone(),
            error: e.to_string(),
        };
        match tokio::time::timeout(self.stop_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(process = %self.name, %status, "Process stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(process = %self.name, error = %e, "Could not confirm process exit");
                Err(stop_error(e))
            }
            Err(_) => {
                tracing::warn!(
                    process = %self.name,
                    grace_secs = self.stop_grace.as_secs(),
                    "Process ignored SIGTERM, killing"
                );
                child.kill().await.map_err(stop_error)
            }
        }
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SIGTERM first so etcd can shut down cleanly
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc == 0 {
            return;
        }
    }
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> ProcessSpec {
        ProcessSpec::new(name, "sh").args(["-c", script])
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let handle = spawn(&sh("echo", "echo out; echo err >&2"), Duration::from_secs(1))
            .await
            .unwrap();

        let mut rx = handle.log().subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.closed))
            .await
            .unwrap()
            .unwrap();

        let mut output = handle.output();
        output.sort();
        assert_eq!(output, vec!["err", "out"]);
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_env_is_passed() {
        let mut env = HashMap::new();
        env.insert("RESYNC_TEST_VALUE".to_string(), "42".to_string());
        let spec = sh("env", "echo value=$RESYNC_TEST_VALUE").envs(&env);

        let handle = spawn(&spec, Duration::from_secs(1)).await.unwrap();
        let mut rx = handle.log().subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.closed))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(handle.output(), vec!["value=42"]);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let handle = spawn(&sh("sleeper", "sleep 30"), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(handle.is_alive().await);

        handle.stop().await.unwrap();
        assert!(!handle.is_alive().await);

        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .expect("second stop must not hang")
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_kills_after_grace_period() {
        let handle = spawn(
            &sh("stubborn", "trap '' TERM; echo trapped; sleep 30"),
            Duration::from_millis(300),
        )
        .await
        .unwrap();

        let mut rx = handle.log().subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| s.len > 0))
            .await
            .unwrap()
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("stop must escalate to SIGKILL")
            .unwrap();
        assert!(!handle.is_alive().await);
    }

    #[tokio::test]
    async fn test_unconfirmed_exit_still_closes_log() {
        let handle = spawn(&sh("reaped", "echo bye"), Duration::from_secs(1))
            .await
            .unwrap();
        let pid = handle.pid().unwrap() as libc::pid_t;

        // Reap the child behind tokio's back so waiting on it fails
        let reaped = tokio::task::spawn_blocking(move || {
            let mut status = 0;
            unsafe { libc::waitpid(pid, &mut status, 0) }
        })
        .await
        .unwrap();
        assert_eq!(reaped, pid);

        let err = handle.stop().await.unwrap_err();
        assert!(matches!(err, Error::Stop { .. }));
        assert!(handle.log().is_closed());
        assert_eq!(handle.output(), vec!["bye"]);

        // Exit was never confirmed, so a second stop does not report success
        assert!(handle.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let spec = ProcessSpec::new("ghost", "/definitely/not/a/binary");
        let err = spawn(&spec, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
