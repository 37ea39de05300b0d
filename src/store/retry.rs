// Retry wrapper for database reads. SQLite under concurrent writers
// returns transient busy errors; backing off and retrying covers the
// common case without surfacing it to the reconcile loop.

use std::time::Duration;
use tokio::time::sleep;

/// Retry a database operation with exponential backoff starting at
/// 100ms. Returns the final error once `max_retries` is exhausted.
pub async fn retry_db_operation<F, T, Fut, E>(
    mut operation: F,
    max_retries: u32,
    description: &str,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if retries > 0 {
                    tracing::info!(
                        "Database operation '{}' succeeded after {} retries",
                        description,
                        retries
                    );
                }
                return Ok(result);
            }
            Err(e) if retries < max_retries => {
                retries += 1;
                let backoff_ms = 50u64 * (1 << retries);
                tracing::warn!(
                    "Database operation '{}' failed (attempt {}/{}): {}. Retrying in {}ms",
                    description,
                    retries,
                    max_retries + 1,
                    e,
                    backoff_ms
                );
                sleep(Duration::from_millis(backoff_ms)).await;
            }
            Err(e) => {
                tracing::error!(
                    "Database operation '{}' failed after {} retries: {}",
                    description,
                    max_retries,
                    e
                );
                return Err(e);
            }
        }
    }
}
