//! Caller-side retry policy for primitive calls
//!
//! Each attempt is bounded by `call_timeout`; retryable failures back off
//! exponentially until `max_retries` extra attempts have been spent.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::error::StageError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first (0 means no retries)
    pub max_retries: u32,
    /// Upper bound on a single attempt
    pub call_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            call_timeout: Duration::from_secs(60),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// A successful call and how many attempts it took
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Attempted<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Counts every attempt made against the primitives
#[derive(Debug, Default)]
pub struct CallMeter {
    calls: AtomicUsize,
}

impl CallMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, calls: usize) {
        self.calls.fetch_add(calls, Ordering::Relaxed);
    }

    pub fn count(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: self.multiplier,
            randomization_factor: 0.1,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Run `op` for `stage` under this policy, recording each attempt in `meter`
    pub async fn call<F, Fut, T>(
        &self,
        stage: &str,
        meter: &CallMeter,
        mut op: F,
    ) -> Result<Attempted<T>, StageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StageError>>,
    {
        let mut backoff = self.backoff();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            meter.record();

            let result = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StageError::UpstreamUnavailable {
                    stage: stage.to_string(),
                    attempts,
                    detail: format!("call timed out after {:?}", self.call_timeout),
                }),
            };

            match result {
                Ok(value) => return Ok(Attempted { value, attempts }),
                Err(err) if err.is_retryable() && attempts <= self.max_retries => {
                    let delay = backoff.next_backoff().unwrap_or(self.max_backoff);
                    warn!(
                        "Stage {} failed, retrying in {:?} (attempt {}/{}): {}",
                        stage,
                        delay,
                        attempts,
                        self.max_retries + 1,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err.with_attempts(attempts)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            call_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    fn unavailable() -> StageError {
        StageError::UpstreamUnavailable {
            stage: "classifier".into(),
            attempts: 1,
            detail: "503".into(),
        }
    }

    #[tokio::test]
    async fn test_two_failures_then_success() {
        let failures = AtomicU32::new(0);
        let failures = &failures;
        let meter = CallMeter::new();

        let result = fast_policy(2)
            .call("classifier", &meter, move || async move {
                if failures.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, 42);
        assert_eq!(result.retries(), 2);
        assert_eq!(meter.count(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let meter = CallMeter::new();
        let err = fast_policy(2)
            .call("classifier", &meter, || async { Err::<(), _>(unavailable()) })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StageError::UpstreamUnavailable { attempts: 3, .. }
        ));
        assert_eq!(meter.count(), 3);
    }

    #[tokio::test]
    async fn test_schema_mismatch_not_retried() {
        let meter = CallMeter::new();
        let err = fast_policy(5)
            .call("classifier", &meter, || async {
                Err::<(), _>(StageError::SchemaMismatch {
                    stage: "classifier".into(),
                    detail: "missing category".into(),
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StageError::SchemaMismatch { .. }));
        assert_eq!(meter.count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_unavailable() {
        let meter = CallMeter::new();
        let policy = RetryPolicy {
            call_timeout: Duration::from_millis(5),
            ..fast_policy(0)
        };

        let err = policy
            .call("classifier", &meter, || async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"));
    }
}
