// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff retry for backend calls.
//!
//! Only calls that can run twice without changing the outcome go through
//! [`retry`]: reads, absolute writes (`SET`, `DEL`, `UPDATE ... SET c = ?`)
//! and (re)connecting. A SQL `INSERT` runs once.
//!
//! | Preset          | Attempts | First delay | Cap    | Used by                         |
//! |-----------------|----------|-------------|--------|---------------------------------|
//! | `connect()`     | 5        | 200ms       | 2s     | SQL pool, Redis connection      |
//! | `command()`     | 3        | 50ms        | 1s     | idempotent SQL and Redis calls  |
//! | `resubscribe()` | forever  | 1s          | 5min   | expiration listener             |
//!
//! Permanent failures (a statement the database refuses, bad input, a value
//! that does not decode) are returned on the first attempt.
//!
//! ```
//! use kv_query_cache::RetryConfig;
//!
//! assert_eq!(RetryConfig::command().max_attempts, Some(3));
//! assert_eq!(RetryConfig::resubscribe().max_attempts, None);
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::storage::traits::StorageError;

/// Whether an error may clear up on its own.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}

impl Transient for redis::RedisError {
    fn is_transient(&self) -> bool {
        self.is_io_error()
            || self.is_timeout()
            || self.is_connection_dropped()
            || matches!(
                self.kind(),
                redis::ErrorKind::BusyLoadingError | redis::ErrorKind::TryAgain
            )
    }
}

/// Backoff schedule of one kind of backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// `None` retries until the call succeeds or fails permanently.
    pub max_attempts: Option<usize>,
}

impl RetryConfig {
    /// Backend connections at startup; a wrong URL surfaces within seconds.
    #[must_use]
    pub fn connect() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_attempts: Some(5),
        }
    }

    /// A single idempotent command on the request path.
    #[must_use]
    pub fn command() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            factor: 2.0,
            max_attempts: Some(3),
        }
    }

    /// The expiration listener: without a subscription nothing is evicted,
    /// so it keeps trying.
    #[must_use]
    pub fn resubscribe() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            factor: 2.0,
            max_attempts: None,
        }
    }

    /// Delay after `current`, capped at `max_delay`.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.factor).min(self.max_delay)
    }

    fn exhausted(&self, attempts: usize) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Run `operation` until it succeeds, fails permanently, or the attempts
/// of `config` run out. The last error is returned.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempts > 0 {
                    debug!(operation = operation_name, retries = attempts, "Recovered after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                attempts += 1;
                if !err.is_transient() || config.exhausted(attempts) {
                    return Err(err);
                }

                crate::metrics::record_retry(operation_name);
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max_attempts = ?config.max_attempts,
                    error = %err,
                    ?delay,
                    "Backend call failed, retrying"
                );
                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}
