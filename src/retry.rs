//! Bounded retry of transient cluster errors
//!
//! A call is retried only when it fails with the single [`ErrorKind`] the
//! policy was built for. Any other failure ends the loop at once.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::common::{Error, ErrorKind, Result};

/// Where a retry loop stands after an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Another attempt will be made after the delay
    Attempting { next_attempt: u32 },
    Succeeded { attempts: u32 },
    /// Every attempt failed with the transient kind
    Exhausted { attempts: u32 },
    /// Failed with a kind that is never retried
    TerminalFailure { attempts: u32 },
}

/// Fixed-delay retry for one transient error kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of calls, including the first
    pub max_attempts: u32,
    pub delay: Duration,
    pub retry_on: ErrorKind,
}

impl RetryPolicy {
    pub fn new(retry_on: ErrorKind, max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            retry_on,
        }
    }

    pub fn is_retryable(&self, err: &Error) -> bool {
        err.cluster_kind() == Some(self.retry_on)
    }

    /// Transition after attempt number `attempt` (1-based) finished
    pub fn transition(&self, attempt: u32, outcome: std::result::Result<(), &Error>) -> RetryState {
        match outcome {
            Ok(()) => RetryState::Succeeded { attempts: attempt },
            Err(e) if !self.is_retryable(e) => RetryState::TerminalFailure { attempts: attempt },
            Err(_) if attempt >= self.max_attempts => RetryState::Exhausted { attempts: attempt },
            Err(_) => RetryState::Attempting {
                next_attempt: attempt + 1,
            },
        }
    }

    /// Run `task` until it succeeds, fails terminally, or runs out of attempts
    ///
    /// The delay between attempts is interrupted by `cancel`.
    pub async fn run<F, Fut, T>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut task: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled(format!(
                    "before attempt {} of {}",
                    attempt, operation
                )));
            }
            let result = task().await;
            let state = self.transition(attempt, result.as_ref().map(|_| ()));

            match (state, result) {
                (RetryState::Succeeded { attempts }, Ok(value)) => {
                    if attempts > 1 {
                        tracing::info!(operation, attempts, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                (RetryState::Attempting { next_attempt }, Err(e)) => {
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Transient failure, retrying in {}ms",
                        self.delay.as_millis()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(Error::Cancelled(format!(
                                "retrying {} after: {}",
                                operation, e
                            )));
                        }
                    }
                    attempt = next_attempt;
                }
                (RetryState::Exhausted { attempts }, Err(e)) => {
                    tracing::warn!(operation, attempts, error = %e, "Giving up");
                    return Err(Error::RetryExhausted {
                        operation: operation.to_string(),
                        attempts,
                        last: Box::new(e),
                    });
                }
                (RetryState::TerminalFailure { .. }, Err(e)) => {
                    return Err(e);
                }
                // transition() only reports success for Ok results and vice versa
                (_, Ok(value)) => return Ok(value),
                (_, Err(e)) => return Err(e),
            }
        }
    }
}
