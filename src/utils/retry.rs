use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Exponential Backoff Retry Strategy
// ============================================================================
//
// Retries an operation with exponentially growing, jittered delays until it
// succeeds, the error is classified permanent, the elapsed-time budget runs
// out, or the caller's cancellation token fires.
//
// Every I/O boundary in the pipeline picks its own named profile:
//
//   broker_read            1s -> 5s,      budget 30s
//   persist_after_consume  500ms -> 2s,   budget 10s
//   db_write               100ms -> 1s,   budget 5s   (configurable)
//   db_read                100ms -> 500ms, budget 3s  (configurable)
//   producer_send          500ms -> 3s,   budget 15s
//
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Operation label used in log lines
    pub name: &'static str,
    /// Delay before the first retry
    pub initial_interval: Duration,
    /// Cap on the (pre-jitter) delay between retries
    pub max_interval: Duration,
    /// Total wall-clock budget, measured from the first attempt
    pub max_elapsed_time: Duration,
    /// Growth factor applied after every retry
    pub multiplier: f64,
    /// Delay is scaled by a random factor in [1 - r, 1 + r]
    pub randomization_factor: f64,
}

impl BackoffPolicy {
    pub fn new(
        name: &'static str,
        max_elapsed_time: Duration,
        initial_interval: Duration,
        max_interval: Duration,
    ) -> Self {
        Self {
            name,
            initial_interval,
            max_interval,
            max_elapsed_time,
            multiplier: 1.5,
            randomization_factor: 0.5,
        }
    }

    pub fn broker_read() -> Self {
        Self::new(
            "broker_read",
            Duration::from_secs(30),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }

    pub fn persist_after_consume() -> Self {
        Self::new(
            "persist_order",
            Duration::from_secs(10),
            Duration::from_millis(500),
            Duration::from_secs(2),
        )
    }

    pub fn db_write() -> Self {
        Self::new(
            "db_write",
            Duration::from_secs(5),
            Duration::from_millis(100),
            Duration::from_secs(1),
        )
    }

    pub fn db_read() -> Self {
        Self::new(
            "db_read",
            Duration::from_secs(3),
            Duration::from_millis(100),
            Duration::from_millis(500),
        )
    }

    pub fn producer_send() -> Self {
        Self::new(
            "producer_send",
            Duration::from_secs(15),
            Duration::from_millis(500),
            Duration::from_secs(3),
        )
    }

    /// Same intervals, deterministic delays
    pub fn without_jitter(mut self) -> Self {
        self.randomization_factor = 0.0;
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(current.as_secs_f64() * self.multiplier)
            .map_or(self.max_interval, |next| next.min(self.max_interval))
    }

    fn randomized(&self, interval: Duration) -> Duration {
        if self.randomization_factor <= 0.0 {
            return interval;
        }
        let delta = self.randomization_factor;
        let factor = rand::rng().random_range((1.0 - delta)..=(1.0 + delta));
        Duration::try_from_secs_f64(interval.as_secs_f64() * factor).unwrap_or(interval)
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// Operation succeeded
    Success(T),
    /// Operation failed with an error that must not be retried
    PermanentFailure(E),
    /// Elapsed-time budget ran out while the error was still transient
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        last_error: E,
    },
    /// Cancellation token fired before the operation could succeed
    Cancelled { attempts: u32 },
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryResult::Success(_))
    }
}

/// Execute an operation with exponential backoff retry.
///
/// `is_permanent` decides which errors stop the loop immediately. The
/// operation receives the 1-based attempt number.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    policy: &BackoffPolicy,
    cancel: Option<&CancellationToken>,
    is_permanent: P,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let start = Instant::now();
    let mut attempt = 0;
    let mut interval = policy.initial_interval;

    loop {
        if cancel.is_some_and(|token| token.is_cancelled()) {
            tracing::warn!(
                operation = policy.name,
                attempts = attempt,
                "Retry loop cancelled"
            );
            return RetryResult::Cancelled { attempts: attempt };
        }

        attempt += 1;

        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(
                        operation = policy.name,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return RetryResult::Success(result);
            }
            Err(error) => {
                if is_permanent(&error) {
                    tracing::error!(
                        operation = policy.name,
                        attempt = attempt,
                        error = %error,
                        "Permanent failure detected, not retrying"
                    );
                    return RetryResult::PermanentFailure(error);
                }

                let delay = policy.randomized(interval);
                let elapsed = start.elapsed();

                if elapsed.saturating_add(delay) > policy.max_elapsed_time {
                    tracing::error!(
                        operation = policy.name,
                        attempt = attempt,
                        elapsed_ms = elapsed.as_millis(),
                        error = %error,
                        "Operation failed, retry budget exhausted"
                    );
                    return RetryResult::Exhausted {
                        attempts: attempt,
                        elapsed,
                        last_error: error,
                    };
                }

                tracing::warn!(
                    operation = policy.name,
                    attempt = attempt,
                    error = %error,
                    delay_ms = delay.as_millis(),
                    "Transient failure, retrying after delay"
                );

                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => {
                                tracing::warn!(
                                    operation = policy.name,
                                    attempts = attempt,
                                    "Retry loop cancelled during backoff"
                                );
                                return RetryResult::Cancelled { attempts: attempt };
                            }
                            _ = sleep(delay) => {}
                        }
                    }
                    None => sleep(delay).await,
                }

                interval = policy.next_interval(interval);
            }
        }
    }
}

/// Check if an error is transient (should retry) or permanent (should not retry)
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// Retry with the error type's own transient classification
pub async fn retry_on_transient<F, Fut, T, E>(
    policy: &BackoffPolicy,
    cancel: Option<&CancellationToken>,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    retry_with_backoff(policy, cancel, |e: &E| !e.is_transient(), operation).await
}
