//! Embedding provider seam and the batched, bounded-concurrency driver
//! used during builds.

use crate::core::config::EmbeddingConfig;
use crate::core::error::{Error, Result};
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Turns text into fixed-width vectors.
///
/// Implementations are synchronous; callers run them on the blocking pool.
pub trait EmbeddingProvider: Send + Sync {
    /// Width of every vector this provider returns
    fn dimensions(&self) -> usize;

    /// One vector per input text, in input order.
    fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Identifies the model so stored vectors can be invalidated when it changes
    fn model_id(&self) -> &str {
        "unknown"
    }
}

/// A batch that produced no usable vectors.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub batch: usize,
    /// Indices of the affected texts in the input
    pub range: Range<usize>,
    pub reason: String,
}

impl BatchFailure {
    pub fn to_error(&self) -> Error {
        Error::EmbeddingBatch {
            batch: self.batch,
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct EmbeddingOutcome {
    /// Same length and order as the input; failed batches hold zero vectors
    pub embeddings: Vec<Vec<f32>>,
    pub failures: Vec<BatchFailure>,
}

/// Cut `text` to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Embed `texts` in batches of `config.batch_size`, at most
/// `config.max_concurrent_batches` in flight, each under `timeout`.
///
/// A batch that errors, times out, panics or returns the wrong number of
/// vectors is replaced by zero vectors and reported in `failures`.
pub async fn embed_in_batches(
    provider: Arc<dyn EmbeddingProvider>,
    texts: &[String],
    config: &EmbeddingConfig,
    timeout: Duration,
) -> EmbeddingOutcome {
    let dimensions = provider.dimensions();
    let batch_size = config.batch_size.max(1);
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_batches.max(1)));

    let batches: Vec<Vec<String>> = texts
        .chunks(batch_size)
        .map(|chunk| {
            chunk
                .iter()
                .map(|t| truncate_chars(t, config.max_chars))
                .collect()
        })
        .collect();

    let mut slots: Vec<Option<Vec<Vec<f32>>>> = vec![None; batches.len()];
    let mut failures = Vec::new();
    let mut tasks = JoinSet::new();

    for (batch_idx, batch) in batches.into_iter().enumerate() {
        let provider = Arc::clone(&provider);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let expected = batch.len();
            let permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return (batch_idx, Err(e.to_string())),
            };
            // the permit lives as long as the provider call, even past a timeout
            let call = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                provider.generate_embeddings(&batch)
            });
            let result = match tokio::time::timeout(timeout, call).await {
                Err(_) => Err(format!("timed out after {} ms", timeout.as_millis())),
                Ok(Err(join_error)) => Err(format!("provider task failed: {}", join_error)),
                Ok(Ok(Err(e))) => Err(e.to_string()),
                Ok(Ok(Ok(vectors))) if vectors.len() != expected => Err(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    expected
                )),
                Ok(Ok(Ok(vectors))) => Ok(vectors),
            };
            (batch_idx, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((batch_idx, Ok(vectors))) => slots[batch_idx] = Some(vectors),
            Ok((batch_idx, Err(reason))) => {
                tracing::warn!(batch = batch_idx, reason = %reason, "embedding batch failed, substituting zero vectors");
                failures.push(BatchFailure {
                    batch: batch_idx,
                    range: batch_range(batch_idx, batch_size, texts.len()),
                    reason,
                });
            }
            Err(e) => tracing::error!(error = %e, "embedding task aborted"),
        }
    }

    // slots never filled and never reported belong to aborted tasks
    for (batch_idx, slot) in slots.iter().enumerate() {
        if slot.is_none() && !failures.iter().any(|f| f.batch == batch_idx) {
            failures.push(BatchFailure {
                batch: batch_idx,
                range: batch_range(batch_idx, batch_size, texts.len()),
                reason: "embedding task aborted".to_string(),
            });
        }
    }
    failures.sort_by_key(|f| f.batch);

    let mut embeddings = Vec::with_capacity(texts.len());
    for (batch_idx, slot) in slots.into_iter().enumerate() {
        match slot {
            Some(vectors) => embeddings.extend(vectors),
            None => {
                let range = batch_range(batch_idx, batch_size, texts.len());
                embeddings.extend(range.map(|_| vec![0.0; dimensions]));
            }
        }
    }

    EmbeddingOutcome {
        embeddings,
        failures,
    }
}

/// Embed a single query text under `timeout`.
pub async fn embed_query(
    provider: Arc<dyn EmbeddingProvider>,
    query: &str,
    max_chars: usize,
    timeout: Duration,
) -> Result<Vec<f32>> {
    let text = vec![truncate_chars(query, max_chars)];
    let call = tokio::task::spawn_blocking(move || provider.generate_embeddings(&text));
    let vectors = tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| Error::Timeout {
            operation: "query embedding".to_string(),
            millis: timeout.as_millis() as u64,
        })?
        .map_err(|e| Error::Model(format!("query embedding task failed: {}", e)))??;
    vectors
        .into_iter()
        .next()
        .ok_or_else(|| Error::Model("provider returned no vector for the query".to_string()))
}

fn batch_range(batch_idx: usize, batch_size: usize, total: usize) -> Range<usize> {
    let start = batch_idx * batch_size;
    start..(start + batch_size).min(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Vector of (length, first byte) per text; fails on texts containing "FAIL".
    struct StubProvider {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl StubProvider {
        fn new() -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    impl EmbeddingProvider for StubProvider {
        fn dimensions(&self) -> usize {
            2
        }

        fn generate_embeddings(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if texts.iter().any(|t| t.contains("FAIL")) {
                return Err(Error::Model("stub failure".to_string()));
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, t.bytes().next().unwrap_or(0) as f32])
                .collect())
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[tokio::test]
    async fn test_batches_keep_order() {
        let provider = Arc::new(StubProvider::new());
        let config = EmbeddingConfig {
            batch_size: 2,
            max_concurrent_batches: 2,
            max_chars: 100,
        };
        let input = texts(&["a", "bb", "ccc", "dddd", "eeeee"]);
        let outcome = embed_in_batches(provider.clone(), &input, &config, Duration::from_secs(5)).await;

        assert!(outcome.failures.is_empty());
        let lengths: Vec<f32> = outcome.embeddings.iter().map(|v| v[0]).collect();
        assert_eq!(lengths, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert!(provider.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_failed_batch_gets_zero_vectors() {
        let provider = Arc::new(StubProvider::new());
        let config = EmbeddingConfig {
            batch_size: 2,
            max_concurrent_batches: 1,
            max_chars: 100,
        };
        let input = texts(&["one", "two", "FAIL", "four", "five", "six"]);
        let outcome = embed_in_batches(provider, &input, &config, Duration::from_secs(5)).await;

        assert_eq!(outcome.embeddings.len(), 6);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].batch, 1);
        assert_eq!(outcome.failures[0].range, 2..4);
        assert_eq!(outcome.embeddings[2], vec![0.0, 0.0]);
        assert_eq!(outcome.embeddings[3], vec![0.0, 0.0]);
        assert_ne!(outcome.embeddings[4], vec![0.0, 0.0]);
        assert!(matches!(outcome.failures[0].to_error(), Error::EmbeddingBatch { batch: 1, .. }));
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let provider = Arc::new(StubProvider::new());
        let config = EmbeddingConfig::default();
        let outcome = embed_in_batches(provider, &texts(&["slow"]), &config, Duration::from_millis(1)).await;
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.embeddings, vec![vec![0.0, 0.0]]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_calls_still_count_against_the_limit() {
        let provider = Arc::new(StubProvider::new());
        let config = EmbeddingConfig {
            batch_size: 1,
            max_concurrent_batches: 1,
            max_chars: 100,
        };
        let input = texts(&["a", "b", "c", "d"]);
        let outcome = embed_in_batches(provider.clone(), &input, &config, Duration::from_millis(2)).await;
        assert_eq!(outcome.failures.len(), 4);

        // let the abandoned calls finish
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_texts_truncated_before_embedding() {
        let provider = Arc::new(StubProvider::new());
        let config = EmbeddingConfig {
            batch_size: 10,
            max_concurrent_batches: 1,
            max_chars: 3,
        };
        let outcome = embed_in_batches(provider, &texts(&["abcdef"]), &config, Duration::from_secs(5)).await;
        assert_eq!(outcome.embeddings[0][0], 3.0);
    }

    #[tokio::test]
    async fn test_embed_query() {
        let provider = Arc::new(StubProvider::new());
        let vector = embed_query(provider.clone(), "query", 100, Duration::from_secs(5)).await.unwrap();
        assert_eq!(vector, vec![5.0, b'q' as f32]);

        let err = embed_query(provider, "FAIL", 100, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, Error::Model(_)));
    }
}
