use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::errors::{AgentError, Result};

/// Cancellation signal shared by the run, the worker pool and every
/// in-flight job. Cancelling closes an internal channel so blocked
/// receivers wake immediately.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Dropping the sender closes the channel and wakes all receivers.
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for the given duration. Returns false if the sleep was cut
    /// short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match self.rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => true,
            _ => false,
        }
    }

    /// Channel that becomes ready when the token is cancelled.
    pub(crate) fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-job execution context: the run cancel token plus an optional
/// deadline. Checked at every suspension point.
#[derive(Clone)]
pub struct JobContext {
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl JobContext {
    pub fn with_timeout(cancel: CancelToken, timeout: Duration) -> Self {
        Self {
            cancel,
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn unbounded(cancel: CancelToken) -> Self {
        Self { cancel, deadline: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Returns an error if the job was cancelled or its deadline passed.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::cancelled());
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(AgentError::timeout("job deadline exceeded"));
            }
        }
        Ok(())
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Clamps a requested timeout to the time left before the deadline.
    pub fn clamp(&self, timeout: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => timeout.min(remaining),
            None => timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_cancel_is_visible_to_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_sleep_completes_without_cancel() {
        let token = CancelToken::new();
        assert!(token.sleep(Duration::from_millis(5)));
    }

    #[test]
    fn test_sleep_interrupted_by_cancel() {
        let token = CancelToken::new();
        let clone = token.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            clone.cancel();
        });
        let start = Instant::now();
        let slept = token.sleep(Duration::from_secs(5));
        handle.join().unwrap();
        assert!(!slept);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_check_after_deadline() {
        let ctx = JobContext::with_timeout(CancelToken::new(), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(2));
        let err = ctx.check().unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Timeout);
    }

    #[test]
    fn test_check_after_cancel() {
        let token = CancelToken::new();
        let ctx = JobContext::unbounded(token.clone());
        assert!(ctx.check().is_ok());
        token.cancel();
        let err = ctx.check().unwrap_err();
        assert_eq!(err.message(), "cancelled");
    }

    #[test]
    fn test_clamp_respects_deadline() {
        let ctx = JobContext::with_timeout(CancelToken::new(), Duration::from_millis(50));
        let clamped = ctx.clamp(Duration::from_secs(30));
        assert!(clamped <= Duration::from_millis(50));

        let unbounded = JobContext::unbounded(CancelToken::new());
        assert_eq!(unbounded.clamp(Duration::from_secs(30)), Duration::from_secs(30));
    }
}
