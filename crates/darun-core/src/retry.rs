use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Bounded exponential backoff applied at each network call site (token exchange,
/// submission, status query). What counts as retryable is decided per site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

/// The error that ended a retried operation, with the number of attempts spent.
#[derive(Debug, Clone)]
pub struct RetryError<E> {
    pub error: E,
    pub attempts: u32,
}

impl RetryPolicy {
    pub const fn new(
        max_attempts: u32,
        base_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
            max_delay,
        }
    }

    /// A single attempt, no retries.
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO, 1.0, Duration::ZERO)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before the retry that follows `retries_used` earlier retries.
    pub fn delay_for(&self, retries_used: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let cap = self.max_delay.max(self.base_delay);
        let exponent = retries_used.min(30) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let scaled = self.base_delay.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= cap.as_secs_f64() {
            cap
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the attempt
    /// cap is reached.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        label: &str,
        op: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        self.run_inner(label, None, op, is_retryable).await
    }

    /// Like [`RetryPolicy::run`], but the backoff between attempts ends as soon as
    /// `cancel` fires. `op` is still called for the next attempt and decides what a
    /// cancelled attempt returns; an attempt already running is never interrupted.
    pub async fn run_until_cancelled<T, E, F, Fut, P>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        op: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        self.run_inner(label, Some(cancel), op, is_retryable).await
    }

    async fn run_inner<T, E, F, Fut, P>(
        &self,
        label: &str,
        cancel: Option<&CancellationToken>,
        mut op: F,
        is_retryable: P,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= max || !is_retryable(&error) {
                        return Err(RetryError {
                            error,
                            attempts: attempt,
                        });
                    }

                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts = max,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %error,
                        "transient failure, retrying"
                    );
                    if !delay.is_zero() {
                        match cancel {
                            Some(cancel) => tokio::select! {
                                biased;
                                _ = cancel.cancelled() => {}
                                _ = sleep(delay) => {}
                            },
                            None => sleep(delay).await,
                        }
                    }
                }
            }
        }
    }
}
