//! Startup retry with exponential backoff
//!
//! The broker may still be coming up when the process starts, so opening the
//! transport is retried until it succeeds, the attempts run out, or the
//! startup deadline would pass before the next attempt. Publishing itself is
//! never retried.

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Cap on the backoff between attempts
    pub max_backoff: Duration,
    /// Overall time budget for startup; no attempt starts after it
    pub deadline: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            deadline: Some(Duration::from_secs(60)),
        }
    }
}

impl RetryConfig {
    /// Delays between consecutive attempts, ignoring the deadline
    pub fn backoffs(&self) -> impl Iterator<Item = Duration> {
        let max_backoff = self.max_backoff;
        std::iter::successors(Some(self.initial_backoff.min(max_backoff)), move |delay| {
            Some((*delay * 2).min(max_backoff))
        })
        .take(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// Run `operation` until it succeeds or the retry budget is spent
///
/// Returns the error of the last attempt when giving up. `context` names the
/// operation in logs (e.g. "nats_connect").
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut backoffs = config.backoffs();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(
                        context = %context,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis(),
                        "Broker ready after retry"
                    );
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        let within_deadline = |delay: &Duration| {
            config
                .deadline
                .map_or(true, |deadline| started.elapsed() + *delay <= deadline)
        };
        let Some(delay) = backoffs.next().filter(within_deadline) else {
            warn!(
                context = %context,
                attempts = attempt,
                elapsed_ms = started.elapsed().as_millis(),
                error = %error,
                "Broker not ready, giving up"
            );
            return Err(error);
        };

        warn!(
            context = %context,
            attempt,
            max_attempts = config.max_attempts,
            backoff_ms = delay.as_millis(),
            error = %error,
            "Broker not ready, retrying"
        );
        sleep(delay).await;
    }
}
