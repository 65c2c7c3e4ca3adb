//! Slow-start batching.
//!
//! Runs `count` calls of an async function in batches whose size starts at
//! `initial_batch_size` and doubles after each fully successful batch. The
//! first batch containing a failure ends the run; the remaining calls are
//! never attempted. This keeps a controller from spamming the API with
//! requests that would all fail for the same reason (quota, admission).

use std::future::Future;

use futures_util::future::join_all;

use crate::BURST_REPLICAS;

/// Outcome of a slow-start run.
#[derive(Debug)]
pub struct BatchResult<E> {
    /// Number of calls that returned `Ok`.
    pub successes: usize,
    /// First error from the failing batch, if any.
    pub error: Option<E>,
}

impl<E> BatchResult<E> {
    /// Discard the success count.
    pub fn into_result(self) -> Result<usize, E> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.successes),
        }
    }
}

/// Call `f(0..count)` in geometrically growing concurrent batches.
///
/// Batch size never exceeds [`BURST_REPLICAS`].
pub async fn slow_start_batch<F, Fut, E>(
    count: usize,
    initial_batch_size: usize,
    f: F,
) -> BatchResult<E>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let mut remaining = count;
    let mut successes = 0;
    let mut index = 0;
    let mut batch_size = initial_batch_size.max(1).min(remaining);

    while batch_size > 0 {
        let results = join_all((index..index + batch_size).map(&f)).await;
        index += batch_size;

        let mut first_error = None;
        for result in results {
            match result {
                Ok(()) => successes += 1,
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if first_error.is_some() {
            return BatchResult {
                successes,
                error: first_error,
            };
        }

        remaining -= batch_size;
        batch_size = (batch_size * 2).min(remaining).min(BURST_REPLICAS);
    }

    BatchResult {
        successes,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_all_succeed() {
        let calls = AtomicUsize::new(0);
        let result = slow_start_batch(10, 1, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), String>(()) }
        })
        .await;

        assert_eq!(result.successes, 10);
        assert!(result.error.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_batches() {
        let seen = Mutex::new(Vec::new());
        // batches: [0], [1,2], [3,4,5,6], ...
        let result = slow_start_batch(10, 1, |i| {
            seen.lock().unwrap().push(i);
            async move {
                if i == 2 {
                    Err(format!("boom {i}"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

        assert_eq!(result.successes, 2);
        assert_eq!(result.error.as_deref(), Some("boom 2"));
        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_zero_count() {
        let result = slow_start_batch(0, 1, |_| async { Err::<(), _>("never") }).await;
        assert_eq!(result.successes, 0);
        assert!(result.into_result().is_ok());
    }
}
