//! Reconnect-and-retry for dropped directory sessions.
//!
//! A transient failure (connection reset, timeout) discards the cached
//! session and replays the operation on a fresh one. Everything else
//! surfaces immediately.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ConnectionSettings;
use crate::error::DirectoryResult;

/// Upper bound on the delay between reconnect attempts.
const MAX_DELAY: Duration = Duration::from_secs(10);

/// How many times, and how patiently, to reconnect after a transient error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect attempts after the first failure.
    pub max_reconnects: u32,
    /// Delay before the first reconnect; doubled for each further attempt.
    pub initial_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_reconnects: 1,
            initial_delay: Duration::ZERO,
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(max_reconnects: u32, initial_delay: Duration) -> Self {
        Self {
            max_reconnects,
            initial_delay,
        }
    }

    /// Policy described by connection settings.
    #[must_use]
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self::new(settings.max_reconnects, settings.retry_delay())
    }

    /// Delay before reconnect attempt `attempt` (0-indexed).
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay.saturating_mul(factor).min(MAX_DELAY)
    }

    /// Run `operation`, calling `reset` and replaying it after transient errors.
    ///
    /// `reset` should drop the cached session so the replay reconnects.
    pub async fn execute<F, Fut, T, R, RFut>(&self, mut operation: F, mut reset: R) -> DirectoryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DirectoryResult<T>>,
        R: FnMut() -> RFut,
        RFut: Future<Output = ()>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < self.max_reconnects => {
                    let delay = self.calculate_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_reconnects = self.max_reconnects,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Directory session lost, reconnecting"
                    );

                    reset().await;
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, error = %e, "Giving up after reconnect");
                    }
                    return Err(e);
                }
            }
        }
    }
}
