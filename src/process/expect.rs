//! Waiting for a line in a process's output
//!
//! A wait starts at the handle's consumed cursor, so lines written before
//! the wait began still count, and it advances the cursor past the match.
//! It never re-scans consumed lines and sleeps between log updates.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::{Error, Result};

use super::handle::ProcessHandle;

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// What to wait for in a process's output, and for how long
pub struct LogExpectation {
    description: String,
    predicate: Predicate,
    filter: Option<String>,
    timeout: Duration,
}

impl fmt::Debug for LogExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogExpectation")
            .field("description", &self.description)
            .field("filter", &self.filter)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl LogExpectation {
    /// Wait for any line satisfying `predicate`
    pub fn new<F>(description: impl Into<String>, timeout: Duration, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            predicate: Box::new(predicate),
            filter: None,
            timeout,
        }
    }

    /// Wait for a line containing a fixed phrase
    pub fn phrase(phrase: &str, timeout: Duration) -> Self {
        let needle = phrase.to_string();
        Self::new(format!("{:?}", phrase), timeout, move |line| {
            line.contains(&needle)
        })
    }

    /// Wait for a single line containing every one of `parts`
    pub fn all_of(parts: &[&str], timeout: Duration) -> Self {
        let needles: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
        Self::new(format!("{:?}", parts), timeout, move |line| {
            needles.iter().all(|n| line.contains(n.as_str()))
        })
    }

    /// Additionally require the line to contain `filter`
    pub fn containing(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn matches(&self, line: &str) -> bool {
        if let Some(filter) = &self.filter {
            if !line.contains(filter.as_str()) {
                return false;
            }
        }
        (self.predicate)(line)
    }
}

impl fmt::Display for LogExpectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.filter {
            Some(filter) => write!(f, "{} containing {:?}", self.description, filter),
            None => write!(f, "{}", self.description),
        }
    }
}

/// Block until a line of `handle`'s output satisfies `expectation`
///
/// Returns the matched line. Fails with `PatternTimeout` once the
/// expectation's timeout elapses, `ProcessExited` if the output closes
/// first, or `Cancelled` if `cancel` fires.
pub async fn await_pattern(
    handle: &ProcessHandle,
    expectation: &LogExpectation,
    cancel: &CancellationToken,
) -> Result<String> {
    let started = Instant::now();
    let deadline = started + expectation.timeout;
    let mut rx = handle.log().subscribe();
    let mut pos = handle.consumed();

    tracing::debug!(process = %handle.name(), expect = %expectation, "Waiting for output");

    loop {
        let closed = rx.borrow_and_update().closed;

        let fresh = handle.log().lines_from(pos);
        let scanned = fresh.len();
        for (offset, line) in fresh.into_iter().enumerate() {
            if expectation.matches(&line) {
                let index = pos + offset;
                handle.consume_through(index);
                tracing::debug!(
                    process = %handle.name(),
                    expect = %expectation,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Matched output line"
                );
                return Ok(line);
            }
        }
        pos += scanned;

        if closed && pos >= handle.log().len() {
            return Err(Error::ProcessExited {
                process: handle.name().to_string(),
                pattern: expectation.to_string(),
            });
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    // Sender lives inside the handle, so this only happens on teardown
                    return Err(Error::ProcessExited {
                        process: handle.name().to_string(),
                        pattern: expectation.to_string(),
                    });
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                return Err(Error::PatternTimeout {
                    pattern: expectation.to_string(),
                    process: handle.name().to_string(),
                    waited: expectation.timeout,
                });
            }
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!(
                    "waiting for {} from '{}'",
                    expectation,
                    handle.name()
                )));
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::handle::{spawn, ProcessSpec};

    async fn sh(name: &str, script: &str) -> ProcessHandle {
        spawn(
            &ProcessSpec::new(name, "sh").args(["-c", script]),
            Duration::from_secs(1),
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_matches_with_filter() {
        let exp = LogExpectation::phrase("Resolver state updated", Duration::from_secs(5))
            .containing("localhost:22379");

        assert!(exp.matches("Resolver state updated: [localhost:12379 localhost:22379]"));
        assert!(!exp.matches("Resolver state updated: [localhost:12379]"));
        assert!(!exp.matches("dialing localhost:22379"));
    }

    #[test]
    fn test_all_of_requires_same_line() {
        let exp = LogExpectation::all_of(&["a", "b"], Duration::from_secs(1));
        assert!(exp.matches("b then a"));
        assert!(!exp.matches("only a"));
    }

    #[tokio::test]
    async fn test_returns_matching_line() {
        let handle = sh("ready", "echo starting; sleep 0.1; echo 'ready to serve client requests'; sleep 30").await;
        let exp = LogExpectation::phrase("ready to serve client requests", Duration::from_secs(5));

        let started = Instant::now();
        let line = await_pattern(&handle, &exp, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(line, "ready to serve client requests");
        assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sees_lines_written_before_wait() {
        let handle = sh("early", "echo marker; sleep 30").await;
        let mut rx = handle.log().subscribe();
        rx.wait_for(|s| s.len > 0).await.unwrap();

        let exp = LogExpectation::phrase("marker", Duration::from_secs(1));
        await_pattern(&handle, &exp, &CancellationToken::new())
            .await
            .unwrap();
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_consumed_lines_are_not_matched_twice() {
        let handle = sh("twice", "echo tick 1; sleep 30").await;
        let exp = LogExpectation::phrase("tick", Duration::from_millis(300));
        let cancel = CancellationToken::new();

        assert_eq!(await_pattern(&handle, &exp, &cancel).await.unwrap(), "tick 1");
        let err = await_pattern(&handle, &exp, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::PatternTimeout { .. }));
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_times_out_without_hanging() {
        let handle = sh("quiet", "echo nothing interesting; sleep 30").await;
        let exp = LogExpectation::phrase("never printed", Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = await_pattern(&handle, &exp, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(3));
        match err {
            Error::PatternTimeout { pattern, process, .. } => {
                assert!(pattern.contains("never printed"));
                assert_eq!(process, "quiet");
            }
            other => panic!("Expected PatternTimeout, got {:?}", other),
        }
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_promptly() {
        let handle = sh("blocked", "sleep 30").await;
        let exp = LogExpectation::phrase("never printed", Duration::from_secs(60));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = await_pattern(&handle, &exp, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_before_match() {
        let handle = sh("crasher", "echo 'member not found in cluster'; exit 1").await;
        let exp = LogExpectation::phrase("ready to serve client requests", Duration::from_secs(30));

        let started = std::time::Instant::now();
        let err = await_pattern(&handle, &exp, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessExited { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
