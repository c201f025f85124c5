//! Deadline racing for remote calls.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("timed out after {limit:?}")]
pub struct TimeoutError {
  pub limit: Duration,
}

/// Race `fut` against a timer of `limit`.
///
/// The losing future is dropped, so a late result can never be observed by
/// the caller.
pub async fn with_timeout<F>(fut: F, limit: Duration) -> Result<F::Output, TimeoutError>
where
  F: Future,
{
  tokio::time::timeout(limit, fut)
    .await
    .map_err(|_| TimeoutError { limit })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test(start_paused = true)]
  async fn test_fast_call_wins() {
    let result = with_timeout(async { 7 }, Duration::from_secs(1)).await;
    assert_eq!(result, Ok(7));
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_call_times_out() {
    let slow = async {
      tokio::time::sleep(Duration::from_secs(30)).await;
      7
    };
    let result = with_timeout(slow, Duration::from_secs(10)).await;
    assert_eq!(
      result,
      Err(TimeoutError {
        limit: Duration::from_secs(10)
      })
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_abandoned_call_does_not_run_to_completion() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let slow = async move {
      tokio::time::sleep(Duration::from_secs(30)).await;
      flag.store(true, Ordering::SeqCst);
    };
    assert!(with_timeout(slow, Duration::from_secs(1)).await.is_err());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!finished.load(Ordering::SeqCst));
  }
}
