//! Fail-open utilities for the cache layer
//!
//! The run cache is an optimization: a failing read or write must degrade to
//! a miss or a skipped store, never abort the caller. Wrap cache I/O in these
//! helpers so the error is logged at debug level and dropped.
//!
//! DO NOT use fail-open for:
//! - Spawning steps (a spawn failure is fatal for the step)
//! - Working directory validation (traversal is a security boundary)

use std::future::Future;
use tracing::debug;

use crate::Result;

/// Execute an async operation that should fail open
///
/// Returns `None` and logs via `tracing::debug!` on failure.
///
/// ```no_run
/// use gauntlet_core::fail_open::fail_open;
/// use gauntlet_core::Result;
///
/// async fn read_note() -> Result<Vec<u8>> {
///     Ok(Vec::new())
/// }
///
/// async fn example() {
///     let bytes = fail_open("note_store::read", || read_note()).await;
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            debug!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GauntletError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, GauntletError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(GauntletError::Cache("corrupt entry".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }
}
