use foreman_core::{CancelSignal, ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Bounded exponential-backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Growth factor applied to the delay after every retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Deadline for a single attempt. A timed-out attempt counts as transient.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: Option<u64>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    32_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_attempt_timeout_ms() -> Option<u64> {
    Some(120_000)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            multiplier: default_multiplier(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after the `retry`-th failure (0-based), capped at the maximum.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry as i32);
        let ms = (self.backoff_base_ms as f64 * factor).min(self.backoff_max_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Runs an operation until it succeeds, fails permanently, or runs out of attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `operation`, retrying failures that `is_retryable` accepts.
    ///
    /// `operation` receives the 1-based attempt number. Non-retryable errors
    /// propagate on first occurrence. After the last attempt the final error
    /// is wrapped in [`ForemanError::RetryExhausted`]. When `cancel` fires,
    /// the running attempt or backoff sleep is abandoned and
    /// [`ForemanError::Cancelled`] is returned.
    pub async fn execute<T, F, Fut, P>(
        &self,
        op_name: &str,
        mut operation: F,
        is_retryable: P,
        cancel: Option<&CancelSignal>,
    ) -> ForemanResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ForemanResult<T>>,
        P: Fn(&ForemanError) -> bool,
    {
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if cancel.is_some_and(CancelSignal::is_cancelled) {
                return Err(ForemanError::Cancelled(format!("{op_name} before attempt {attempt}")));
            }

            let outcome = with_cancel(cancel, op_name, self.run_attempt(op_name, attempt, &mut operation)).await?;

            let err = match outcome {
                Ok(value) => {
                    info!(op = op_name, attempt, "Attempt succeeded");
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !is_retryable(&err) {
                warn!(op = op_name, attempt, error = %err, "Non-retryable error, giving up");
                return Err(err);
            }

            if attempt == max_attempts {
                warn!(op = op_name, attempt, error = %err, "Retries exhausted");
                return Err(ForemanError::RetryExhausted {
                    attempts: attempt,
                    last_cause: Box::new(err),
                });
            }

            let delay = self.policy.delay_for(attempt - 1);
            info!(
                op = op_name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retryable error, backing off"
            );
            with_cancel(cancel, op_name, tokio::time::sleep(delay)).await?;
        }

        // max_attempts >= 1, so the loop always returns.
        Err(ForemanError::Cancelled(format!("{op_name} made no attempts")))
    }

    /// [`execute`](Self::execute) with [`ForemanError::is_transient`] as the predicate.
    pub async fn execute_transient<T, F, Fut>(
        &self,
        op_name: &str,
        operation: F,
        cancel: Option<&CancelSignal>,
    ) -> ForemanResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ForemanResult<T>>,
    {
        self.execute(op_name, operation, ForemanError::is_transient, cancel)
            .await
    }

    async fn run_attempt<T, F, Fut>(
        &self,
        op_name: &str,
        attempt: u32,
        operation: &mut F,
    ) -> ForemanResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = ForemanResult<T>>,
    {
        let fut = operation(attempt);
        match self.policy.attempt_timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), fut).await {
                Ok(result) => result,
                Err(_) => Err(ForemanError::TransientService(format!(
                    "{op_name} attempt {attempt} timed out after {ms}ms"
                ))),
            },
            None => fut.await,
        }
    }
}

/// Race `fut` against the cancel signal. The outer error is the cancellation.
async fn with_cancel<F: Future>(
    cancel: Option<&CancelSignal>,
    op_name: &str,
    fut: F,
) -> ForemanResult<F::Output> {
    match cancel {
        Some(cancel) => tokio::select! {
            out = fut => Ok(out),
            _ = cancel.cancelled() => Err(ForemanError::Cancelled(op_name.to_string())),
        },
        None => Ok(fut.await),
    }
}
