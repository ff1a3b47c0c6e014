//! Bounded concurrent fan-out for sink reads (spec §5 concurrency model).
//!
//! Generalizes the RPC-fetch worker pool's bounded-concurrency-with-retry
//! idiom to the reads the Transformer issues mid-batch: address-id lookups,
//! relation reads, balance reads, and secondary-id maxima. Each work item is
//! retried independently with the same backoff schedule used for raw-source
//! fetches; one item's exhausted retries doesn't block the others.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;

const RETRY_DELAYS_SECS: [u64; 5] = [1, 2, 5, 10, 20];
const MAX_RETRIES: usize = RETRY_DELAYS_SECS.len();

#[derive(Debug)]
pub enum WorkResult<T> {
    Success(T),
    Error { index: usize, error: String },
}

/// Runs `work(item)` for every item in `items`, at most `concurrency` at a
/// time, retrying a failing item up to [`MAX_RETRIES`] times with the same
/// backoff schedule the raw-source fetcher uses. Results are returned in
/// the same order as `items`.
pub async fn run_bounded<T, I, F, Fut, E>(
    items: Vec<I>,
    concurrency: usize,
    work: F,
) -> Vec<WorkResult<T>>
where
    I: Clone + Send + 'static,
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let work = Arc::new(work);

    let tasks = items.into_iter().enumerate().map(|(index, item)| {
        let semaphore = semaphore.clone();
        let work = work.clone();
        async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            let mut attempt = 0usize;
            loop {
                match work(item.clone()).await {
                    Ok(value) => return WorkResult::Success(value),
                    Err(e) => {
                        if attempt >= MAX_RETRIES {
                            tracing::warn!(index, error = %e, "work item exhausted retries");
                            return WorkResult::Error {
                                index,
                                error: e.to_string(),
                            };
                        }
                        let delay = RETRY_DELAYS_SECS[attempt.min(RETRY_DELAYS_SECS.len() - 1)];
                        tracing::debug!(index, attempt, delay, error = %e, "retrying work item");
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                        attempt += 1;
                    }
                }
            }
        }
    });

    join_all(tasks).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let results = run_bounded(vec![1, 2, 3], 2, |i: i32| async move {
            Ok::<i32, String>(i * 2)
        })
        .await;
        let values: Vec<i32> = results
            .into_iter()
            .map(|r| match r {
                WorkResult::Success(v) => v,
                WorkResult::Error { .. } => panic!("unexpected error"),
            })
            .collect();
        assert_eq!(values, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let results = run_bounded(vec![1], 1, move |_: i32| {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 1 {
                    Err::<i32, String>("transient".to_string())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert!(matches!(results[0], WorkResult::Success(42)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
