//! # Retry Policy
//!
//! Bounded exponential backoff around one unit of work.
//!
//! ```text
//!   attempt 1 ──► Busy ──► sleep 10ms
//!   attempt 2 ──► WriteConflict ──► sleep 20ms
//!   attempt 3 ──► Ok ─────────────────────────────► caller
//!        ...
//!   attempt N ──► Busy ──► StorageUnavailable { attempts: N }
//!
//!   any CoreError / non-transient DbError ──► caller, no retry
//! ```
//!
//! The closure must rebuild the whole transaction each time: a retried
//! attempt re-reads the line and re-runs the rules against fresh state.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tracing::{error, warn};

use crate::config::RetrySettings;
use crate::error::{LedgerError, LedgerResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    pub fn from_config(settings: &RetrySettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_millis(settings.initial_backoff_ms),
            Duration::from_millis(settings.max_backoff_ms),
        )
    }

    /// Single attempt, no sleeping.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: 2.0,
            max_elapsed_time: None, // bounded by max_attempts instead
            ..Default::default()
        }
    }

    /// Runs `attempt` until it succeeds, fails permanently, or the attempt
    /// budget is spent.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> LedgerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LedgerResult<T>>,
    {
        let mut backoff = self.create_backoff();
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let last_error = match attempt().await {
                Ok(value) => return Ok(value),
                Err(LedgerError::Db(e)) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            if attempts >= self.max_attempts {
                error!(
                    operation,
                    attempts,
                    error = %last_error,
                    "Retry budget exhausted"
                );
                return Err(LedgerError::StorageUnavailable {
                    operation,
                    attempts,
                    last_error,
                });
            }

            let delay = backoff.next_backoff().unwrap_or(self.max_backoff);
            warn!(
                operation,
                attempt = attempts,
                ?delay,
                error = %last_error,
                "Transient storage failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use supplyline_core::CoreError;

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::default();

        let result = policy
            .run("test", move || async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(LedgerError::Db(DbError::Busy("database is locked".into())))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_storage_unavailable() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::new(3, Duration::from_millis(5), Duration::from_millis(20));

        let result: LedgerResult<()> = policy
            .run("reserve", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(LedgerError::Db(DbError::write_conflict("inventory_line", "l1", 4)))
            })
            .await;

        match result {
            Err(LedgerError::StorageUnavailable {
                operation,
                attempts,
                last_error,
            }) => {
                assert_eq!(operation, "reserve");
                assert_eq!(attempts, 3);
                assert!(matches!(last_error, DbError::WriteConflict { .. }));
            }
            other => panic!("expected StorageUnavailable, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_business_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let policy = RetryPolicy::default();

        let result: LedgerResult<()> = policy
            .run("stock_out", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(CoreError::InsufficientStock {
                    available: 1,
                    requested: 2,
                }
                .into())
            })
            .await;

        assert!(matches!(
            result,
            Err(LedgerError::Rule(CoreError::InsufficientStock { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_retry_policy_gives_up_immediately() {
        let result: LedgerResult<()> = RetryPolicy::no_retry()
            .run("noop", || async { Err(LedgerError::Db(DbError::PoolExhausted)) })
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::StorageUnavailable { attempts: 1, .. })
        ));
    }
}
