//! Append-only output log of a child process
//!
//! Reader tasks append lines as they arrive; waiters subscribe to a
//! `watch` channel carrying the current length and are woken on growth.

use std::sync::Mutex;

use tokio::sync::watch;

/// Snapshot of a log's growth, published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogState {
    /// Number of lines appended so far
    pub len: usize,
    /// No more lines will ever be appended
    pub closed: bool,
}

/// Ordered, continuously growing sequence of output lines
#[derive(Debug)]
pub struct OutputLog {
    lines: Mutex<Vec<String>>,
    state: watch::Sender<LogState>,
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputLog {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LogState::default());
        Self {
            lines: Mutex::new(Vec::new()),
            state,
        }
    }

    /// Append a line and wake every waiter
    pub fn push(&self, line: String) {
        let len = {
            let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
            lines.push(line);
            lines.len()
        };
        self.state.send_modify(|s| s.len = len);
    }

    /// Mark the log as complete; later pushes are still accepted but
    /// waiters treat the stream as ended
    pub fn close(&self) {
        self.state.send_modify(|s| s.closed = true);
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn len(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines appended at or after `from`
    pub fn lines_from(&self, from: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.get(from..).map(|s| s.to_vec()).unwrap_or_default()
    }

    /// Every line captured so far
    pub fn snapshot(&self) -> Vec<String> {
        self.lines_from(0)
    }

    /// Subscribe to growth notifications
    pub fn subscribe(&self) -> watch::Receiver<LogState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_lines_from() {
        let log = OutputLog::new();
        log.push("a".to_string());
        log.push("b".to_string());
        log.push("c".to_string());

        assert_eq!(log.lines_from(1), vec!["b", "c"]);
        assert!(log.lines_from(3).is_empty());
        assert!(log.lines_from(10).is_empty());
        assert_eq!(log.snapshot().len(), 3);
    }

    #[tokio::test]
    async fn test_subscriber_woken_on_push() {
        let log = std::sync::Arc::new(OutputLog::new());
        let mut rx = log.subscribe();

        let writer = log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.push("hello".to_string());
        });

        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().len, 1);
    }

    #[test]
    fn test_close() {
        let log = OutputLog::new();
        assert!(!log.is_closed());
        log.close();
        assert!(log.is_closed());
    }
}
