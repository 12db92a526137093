//! Batching and bounded retry for remote batch APIs

use gwview_core::metrics::StorageMetrics;
use gwview_core::prelude::*;
use std::future::Future;
use tracing::warn;

/// Largest batch a remote batch call accepts
pub const MAX_BATCH_SIZE: usize = 25;

/// Attempts made before unprocessed items become a hard error
pub const MAX_BATCH_ATTEMPTS: u32 = 3;

/// Split `keys` into consecutive batches of at most `size` items
pub fn chunk_keys<T: Clone>(keys: &[T], size: usize) -> Vec<Vec<T>> {
    keys.chunks(size.max(1)).map(|chunk| chunk.to_vec()).collect()
}

/// Result of one batch call
#[derive(Debug)]
pub struct BatchOutcome<I, O> {
    pub completed: Vec<O>,
    /// Items the backend did not get to
    pub unprocessed: Vec<I>,
}

impl<I, O> BatchOutcome<I, O> {
    pub fn complete(completed: Vec<O>) -> Self {
        Self {
            completed,
            unprocessed: Vec::new(),
        }
    }
}

/// Run `call` over `items` in batches of [`MAX_BATCH_SIZE`], re-batching
/// whatever comes back unprocessed.
///
/// Fails with [`GatewayError::RetryExhausted`] naming the remaining items
/// after [`MAX_BATCH_ATTEMPTS`] rounds.
pub async fn run_batched<I, O, F, Fut>(
    items: Vec<I>,
    metrics: &StorageMetrics,
    describe: impl Fn(&I) -> String,
    mut call: F,
) -> Result<Vec<O>>
where
    I: Clone,
    F: FnMut(Vec<I>) -> Fut,
    Fut: Future<Output = Result<BatchOutcome<I, O>>>,
{
    let mut completed = Vec::new();
    let mut pending = items;

    for attempt in 1..=MAX_BATCH_ATTEMPTS {
        let mut unprocessed = Vec::new();
        for batch in chunk_keys(&pending, MAX_BATCH_SIZE) {
            let outcome = call(batch).await?;
            completed.extend(outcome.completed);
            unprocessed.extend(outcome.unprocessed);
        }

        if unprocessed.is_empty() {
            return Ok(completed);
        }
        if attempt < MAX_BATCH_ATTEMPTS {
            warn!(
                attempt,
                remaining = unprocessed.len(),
                "Batch left items unprocessed, retrying"
            );
            metrics.record_batch_retry();
        }
        pending = unprocessed;
    }

    let keys: Vec<String> = pending.iter().map(describe).collect();
    Err(GatewayError::RetryExhausted {
        attempts: MAX_BATCH_ATTEMPTS,
        message: format!("unprocessed keys: {}", keys.join(", ")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_chunk_keys_partitions_in_order() {
        for n in [0usize, 1, 24, 25, 26, 50, 51, 137] {
            let keys: Vec<usize> = (0..n).collect();
            let batches = chunk_keys(&keys, MAX_BATCH_SIZE);

            assert_eq!(batches.len(), n.div_ceil(MAX_BATCH_SIZE), "n = {}", n);
            assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= MAX_BATCH_SIZE));
            assert_eq!(batches.concat(), keys);
        }
    }

    #[tokio::test]
    async fn test_unprocessed_items_are_retried() {
        let calls = AtomicU32::new(0);
        let metrics = StorageMetrics::new("test");

        // First round leaves the last item of every batch behind
        let done = run_batched((0..30).collect(), &metrics, |i| i.to_string(), |batch: Vec<u32>| {
            let round = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if round < 2 {
                    let mut batch = batch;
                    let left = batch.pop().into_iter().collect();
                    Ok(BatchOutcome { completed: batch, unprocessed: left })
                } else {
                    Ok(BatchOutcome::complete(batch))
                }
            }
        })
        .await
        .unwrap();

        let mut done = done;
        done.sort();
        assert_eq!(done, (0..30).collect::<Vec<_>>());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_names_keys() {
        let metrics = StorageMetrics::new("test");
        let err = run_batched(
            vec!["gw1".to_string(), "gw2".to_string()],
            &metrics,
            |k| k.clone(),
            |batch: Vec<String>| async move {
                Ok(BatchOutcome::<String, ()> {
                    completed: Vec::new(),
                    unprocessed: batch,
                })
            },
        )
        .await
        .unwrap_err();

        match err {
            GatewayError::RetryExhausted { attempts, message } => {
                assert_eq!(attempts, MAX_BATCH_ATTEMPTS);
                assert!(message.contains("gw1") && message.contains("gw2"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
