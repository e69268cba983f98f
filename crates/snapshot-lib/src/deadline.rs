//! Cancellable deadlines shared by concurrent tasks
//!
//! A [`CancelScope`] owns the cancellation signal; every [`Deadline`] derived
//! from it observes both the signal and its own expiry instant.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// Why a deadline is no longer live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineState {
    /// The owning scope was cancelled
    Cancelled,
    /// The expiry instant passed
    Expired,
}

impl fmt::Display for DeadlineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadlineState::Cancelled => f.write_str("cancelled"),
            DeadlineState::Expired => f.write_str("deadline exceeded"),
        }
    }
}

/// Owner of a cancellation signal
#[derive(Debug)]
pub struct CancelScope {
    tx: watch::Sender<bool>,
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Derive a deadline expiring after `timeout` and tied to this scope
    pub fn deadline(&self, timeout: Duration) -> Deadline {
        Deadline {
            expires_at: Instant::now() + timeout,
            cancel: self.tx.subscribe(),
        }
    }

    /// Cancel every deadline derived from this scope
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// A deadline that can also be cancelled early
#[derive(Debug, Clone)]
pub struct Deadline {
    expires_at: Instant,
    cancel: watch::Receiver<bool>,
}

impl Deadline {
    /// Standalone deadline that only expires, never cancels
    pub fn after(timeout: Duration) -> Self {
        let (_tx, cancel) = watch::channel(false);
        Self {
            expires_at: Instant::now() + timeout,
            cancel,
        }
    }

    /// Derive a deadline no later than `timeout` from now, sharing cancellation
    pub fn child(&self, timeout: Duration) -> Self {
        Self {
            expires_at: self.expires_at.min(Instant::now() + timeout),
            cancel: self.cancel.clone(),
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }

    /// Current state, or `None` while still live
    pub fn state(&self) -> Option<DeadlineState> {
        if *self.cancel.borrow() {
            Some(DeadlineState::Cancelled)
        } else if Instant::now() >= self.expires_at {
            Some(DeadlineState::Expired)
        } else {
            None
        }
    }

    /// Resolve once the deadline is cancelled or expires
    pub async fn done(&self) -> DeadlineState {
        let mut cancel = self.cancel.clone();
        loop {
            if *cancel.borrow_and_update() {
                return DeadlineState::Cancelled;
            }
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() {
                        // Scope dropped without cancelling: only expiry remains
                        sleep_until(self.expires_at).await;
                        return DeadlineState::Expired;
                    }
                }
                _ = sleep_until(self.expires_at) => return DeadlineState::Expired,
            }
        }
    }

    /// Race `fut` against this deadline, dropping it if the deadline wins
    pub async fn bound<F, T>(&self, fut: F) -> Result<T, DeadlineState>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            state = self.done() => Err(state),
            value = fut => Ok(value),
        }
    }
}
