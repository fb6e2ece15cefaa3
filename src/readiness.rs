//! Bounded readiness polling.
//!
//! Used before any channel exists: probe the server until it answers, at
//! most `max_attempts` times, sleeping `interval` between attempts (never
//! before the first or after the last).

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::AppError;

/// Where a poll run currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Polling { attempt: u32 },
    Succeeded { attempt: u32 },
    TimedOut,
}

#[derive(Debug, Clone, Copy)]
pub struct Poller {
    max_attempts: u32,
    interval: Duration,
}

impl Poller {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self { max_attempts, interval }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Run `probe` until it returns `true`. Returns the 1-based attempt that
    /// succeeded, or a Timeout error after `max_attempts` failures. A probe
    /// error counts as a failed attempt. The probe always runs at least once.
    pub async fn poll<F, Fut, E>(&self, mut probe: F) -> Result<u32, AppError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: std::fmt::Display,
    {
        let mut state = PollState::Polling { attempt: 1 };

        while let PollState::Polling { attempt } = state {
            state = match probe().await {
                Ok(true) => PollState::Succeeded { attempt },
                Ok(false) => {
                    debug!(attempt, max = self.max_attempts, "not ready yet");
                    self.next(attempt)
                }
                Err(e) => {
                    debug!(attempt, max = self.max_attempts, error = %e, "probe failed");
                    self.next(attempt)
                }
            };

            if let PollState::Polling { .. } = state {
                tokio::time::sleep(self.interval).await;
            }
        }

        match state {
            PollState::Succeeded { attempt } => {
                info!(attempt, "server reachable");
                Ok(attempt)
            }
            _ => Err(AppError::Timeout(format!(
                "server not reachable after {} attempts",
                self.max_attempts.max(1)
            ))),
        }
    }

    fn next(&self, attempt: u32) -> PollState {
        if attempt >= self.max_attempts {
            PollState::TimedOut
        } else {
            PollState::Polling { attempt: attempt + 1 }
        }
    }
}
