//! Retry utilities: backoff builders and retryable error classification.
//!
//! Uses `backon` for exponential backoff with jitter. Only connection-level
//! failures are ever retried; concurrency conflicts surface to the caller.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::config::RetryConfig;
use crate::storage::StorageError;

/// Backoff for subscription reconnects.
///
/// Defaults (see [`RetryConfig`]):
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff(config: &RetryConfig) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(config.min_delay_ms))
        .with_max_delay(Duration::from_millis(config.max_delay_ms))
        .with_max_times(config.max_times)
        .with_jitter()
}

/// Determines if a storage error is worth retrying (connection failures only).
///
/// Non-retryable:
/// - `Concurrency`: the caller must reload and decide again
/// - `StreamDeleted`: permanent
pub fn is_retryable(error: &StorageError) -> bool {
    matches!(error, StorageError::Connection(_))
}
