// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded exponential backoff for startup connections.
//!
//! Only transient errors are retried. A bad connection string or an invalid
//! schema name fails on the first attempt so misconfiguration is reported
//! immediately instead of after the full backoff.
//!
//! # Example
//!
//! ```
//! use crate_sync::RetryConfig;
//! use std::time::Duration;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//! assert!(startup.max_delay <= Duration::from_secs(2));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use crate::storage::StorageError;
use crate::sync::SyncError;

/// Errors that may go away on their own.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        self.is_unavailable()
    }
}

impl Transient for SyncError {
    fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Ledger(_))
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first one
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Five attempts, 200ms doubling up to 2s. Gives up after roughly 5s.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_attempts: 5,
        }
    }

    /// Single attempt.
    #[must_use]
    pub fn none() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
            max_attempts: 1,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_attempts: 3,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt >= config.max_attempts => return Err(err),
            Err(err) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = config.max_attempts,
                    error = %err,
                    retry_in = ?delay,
                    "Transient failure, retrying"
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result: Result<i32, StorageError> = retry("test_op", &RetryConfig::test(), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<i32, StorageError> = retry("test_op", &RetryConfig::test(), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(StorageError::Unavailable(format!("down {}", n)))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), StorageError> = retry("test_op", &RetryConfig::test(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::Unavailable("always down".into()))
            }
        })
        .await;

        assert!(result.unwrap_err().is_unavailable());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_config_errors_are_not_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result: Result<(), StorageError> = retry("test_op", &RetryConfig::test(), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::InvalidConfig("bad url".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(StorageError::InvalidConfig(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            max_attempts: 5,
        };
        assert_eq!(config.next_delay(config.initial_delay), Duration::from_secs(5));
        assert_eq!(RetryConfig::startup().next_delay(Duration::from_millis(200)), Duration::from_millis(400));
    }

    #[test]
    fn test_sync_error_transience() {
        assert!(SyncError::Transport("reset".into()).is_transient());
        assert!(!SyncError::Closed.is_transient());
    }
}
