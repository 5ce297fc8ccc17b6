//! Fail-open helpers for side channels
//!
//! Activity logs and observers must never change the outcome of a run. Wrap
//! them with [`fail_open`] so their errors turn into a `warn!` line.
//!
//! Stage functions are never fail-open: their errors end the run.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run a side-channel operation, logging and swallowing its error
///
/// ```no_run
/// use agentflow_core::fail_open::fail_open;
/// use agentflow_core::Result;
///
/// async fn append_activity() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("activity_log", || append_activity()).await;
///     assert!(written.is_some());
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
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlowError;

    #[tokio::test]
    async fn test_fail_open_success() {
        let result = fail_open("test_op", || async { Ok::<_, FlowError>(42) }).await;
        assert_eq!(result, Some(42));
    }

    #[tokio::test]
    async fn test_fail_open_failure() {
        let result = fail_open("test_op", || async {
            Err::<i32, _>(FlowError::Other("disk full".to_string()))
        })
        .await;
        assert_eq!(result, None);
    }
}
