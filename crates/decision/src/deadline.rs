//! Bounded waits on store calls.

use rotator_core::{RotatorError, RotatorResult};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Await `fut` for at most `limit`. On expiry the future is dropped, which
/// abandons any uncommitted store work, and `Timeout` is returned.
pub async fn within<T, F>(limit: Duration, operation: &'static str, fut: F) -> RotatorResult<T>
where
    F: Future<Output = RotatorResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            metrics::counter!("rotator.timeouts", "operation" => operation).increment(1);
            warn!(operation, limit_ms = limit.as_millis() as u64, "Operation timed out");
            Err(RotatorError::Timeout {
                operation,
                elapsed: limit,
            })
        }
    }
}
