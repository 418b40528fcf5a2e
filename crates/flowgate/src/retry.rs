//! Bounded retry policies and the cancellable backoff they sleep through.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::{ExtractionConfig, RemoteConfig};
use crate::error::{Error, ErrorKind, Result};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Shared cancellation flag with an optional deadline.
///
/// Clones observe the same flag, so a caller can hand one to a blocking
/// evaluation and cancel it from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::new(ErrorKind::Cancelled, "cancelled"));
        }
        if self.remaining().is_some_and(|r| r.is_zero()) {
            return Err(Error::new(ErrorKind::Timeout, "deadline exceeded"));
        }
        Ok(())
    }
}

pub trait Sleeper: Send + Sync {
    /// Wait for `duration`, returning early with an error if `cancel` fires.
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()>;
}

/// Sleeps on the calling thread in short slices so cancellation is noticed promptly.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration, cancel: &CancelToken) -> Result<()> {
        let until = Instant::now() + duration;
        loop {
            cancel.check()?;
            let left = until.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(());
            }
            let mut step = left.min(SLEEP_SLICE);
            if let Some(r) = cancel.remaining() {
                step = step.min(r);
            }
            std::thread::sleep(step);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    pub fn extraction(cfg: &ExtractionConfig) -> Self {
        Self::new(cfg.attempts, Duration::from_millis(cfg.backoff_ms))
    }

    /// `ntries` is the per-request override carried in `_ntries`.
    pub fn remote(cfg: &RemoteConfig, ntries: Option<u32>) -> Self {
        Self::new(ntries.unwrap_or(cfg.attempts), cfg.backoff())
    }
}
