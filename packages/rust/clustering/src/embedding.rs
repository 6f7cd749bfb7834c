//! Batched, bounded-concurrency embedding with per-item fallback.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use marketbrief_inference::EmbeddingClient;

/// Embed every text, returning `None` where embedding failed.
///
/// Identical texts are sent once. Batches run on at most `max_concurrency`
/// tasks; a failed batch is retried one item at a time. Vectors whose
/// dimension differs from the first successful vector are discarded.
#[instrument(skip_all, fields(texts = texts.len(), batch_size, max_concurrency))]
pub async fn embed_all<E: EmbeddingClient>(
    client: Arc<E>,
    texts: &[String],
    batch_size: usize,
    max_concurrency: usize,
) -> Vec<Option<Vec<f32>>> {
    if texts.is_empty() {
        return Vec::new();
    }

    // Same-run cache: map each input to its first identical text.
    let mut unique: Vec<String> = Vec::new();
    let mut slot_of: HashMap<&str, usize> = HashMap::new();
    let slots: Vec<usize> = texts
        .iter()
        .map(|text| {
            *slot_of.entry(text.as_str()).or_insert_with(|| {
                unique.push(text.clone());
                unique.len() - 1
            })
        })
        .collect();
    debug!(unique = unique.len(), "deduplicated embedding inputs");

    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut handles = Vec::new();
    for batch in unique.chunks(batch_size.max(1)) {
        let batch = batch.to_vec();
        let client = Arc::clone(&client);
        let sem = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return vec![None; batch.len()];
            };
            embed_batch(client.as_ref(), &batch).await
        }));
    }

    let mut vectors: Vec<Option<Vec<f32>>> = Vec::with_capacity(unique.len());
    for (handle, batch) in handles.into_iter().zip(unique.chunks(batch_size.max(1))) {
        match handle.await {
            Ok(results) => vectors.extend(results),
            Err(e) => {
                warn!(error = %e, size = batch.len(), "embedding task panicked");
                vectors.extend(std::iter::repeat_n(None, batch.len()));
            }
        }
    }

    enforce_dimension(&mut vectors);

    slots.into_iter().map(|slot| vectors[slot].clone()).collect()
}

/// Embed one batch, falling back to one request per item on failure.
///
/// The client has already spent its retry budget when an item fails with a
/// retryable error, so the remaining items are marked failed without
/// further requests.
async fn embed_batch<E: EmbeddingClient>(client: &E, batch: &[String]) -> Vec<Option<Vec<f32>>> {
    match client.embed(batch).await {
        Ok(vectors) if vectors.len() == batch.len() => {
            return vectors.into_iter().map(Some).collect();
        }
        Ok(vectors) => warn!(
            expected = batch.len(),
            received = vectors.len(),
            "embedding batch returned wrong count, retrying per item"
        ),
        Err(e) => warn!(error = %e, size = batch.len(), "embedding batch failed, retrying per item"),
    }

    let mut results = Vec::with_capacity(batch.len());
    for text in batch {
        let single = std::slice::from_ref(text);
        match client.embed(single).await {
            Ok(mut vectors) if vectors.len() == 1 => results.push(vectors.pop()),
            Ok(_) => {
                warn!("embedding returned wrong count for single item");
                results.push(None);
            }
            Err(e) if e.is_retryable() => {
                let skipped = batch.len() - results.len() - 1;
                warn!(error = %e, skipped, "embedding endpoint unavailable, abandoning batch");
                results.resize(batch.len(), None);
                break;
            }
            Err(e) => {
                warn!(error = %e, "embedding failed for item");
                results.push(None);
            }
        }
    }
    results
}

/// Drop empty vectors and those whose length differs from the first vector.
fn enforce_dimension(vectors: &mut [Option<Vec<f32>>]) {
    for slot in vectors.iter_mut() {
        if slot.as_ref().is_some_and(|v| v.is_empty()) {
            *slot = None;
        }
    }

    let Some(dims) = vectors.iter().flatten().map(Vec::len).next() else {
        return;
    };
    for slot in vectors.iter_mut() {
        if slot.as_ref().is_some_and(|v| v.len() != dims) {
            warn!(expected = dims, "embedding dimension mismatch");
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use super::*;
    use marketbrief_inference::InferenceError;

    /// Returns `[len(text), 1.0]` per text and records every request.
    #[derive(Default)]
    struct RecordingEmbedder {
        failing: HashSet<String>,
        outage: bool,
        ragged: HashSet<String>,
        requests: Mutex<Vec<Vec<String>>>,
    }

    impl EmbeddingClient for RecordingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
            self.requests.lock().unwrap().push(texts.to_vec());
            if self.outage {
                return Err(InferenceError::Status {
                    endpoint: "mock".into(),
                    status: 503,
                    body: String::new(),
                });
            }
            if texts.iter().any(|t| self.failing.contains(t)) {
                return Err(InferenceError::Status {
                    endpoint: "mock".into(),
                    status: 422,
                    body: String::new(),
                });
            }
            Ok(texts
                .iter()
                .map(|t| {
                    if self.ragged.contains(t) {
                        vec![1.0, 2.0, 3.0]
                    } else {
                        vec![t.len() as f32, 1.0]
                    }
                })
                .collect())
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn batches_preserve_input_order() {
        let client = Arc::new(RecordingEmbedder::default());
        let input = texts(&["a", "bb", "ccc", "dddd", "eeeee"]);
        let vectors = embed_all(Arc::clone(&client), &input, 2, 2).await;

        let lens: Vec<f32> = vectors.iter().map(|v| v.as_ref().unwrap()[0]).collect();
        assert_eq!(lens, vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(client.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn identical_texts_are_embedded_once() {
        let client = Arc::new(RecordingEmbedder::default());
        let input = texts(&["same", "other", "same"]);
        let vectors = embed_all(Arc::clone(&client), &input, 10, 1).await;

        assert_eq!(vectors[0], vectors[2]);
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0], texts(&["same", "other"]));
    }

    #[tokio::test]
    async fn failed_batch_falls_back_per_item() {
        let client = Arc::new(RecordingEmbedder {
            failing: HashSet::from(["bad".to_string()]),
            ..Default::default()
        });
        let input = texts(&["ok1", "bad", "ok22"]);
        let vectors = embed_all(Arc::clone(&client), &input, 3, 1).await;

        assert!(vectors[0].is_some());
        assert!(vectors[1].is_none());
        assert_eq!(vectors[2].as_ref().unwrap()[0], 4.0);
        // One batch request plus three single-item retries.
        assert_eq!(client.requests.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn outage_stops_after_first_item_failure() {
        let client = Arc::new(RecordingEmbedder {
            outage: true,
            ..Default::default()
        });
        let input = texts(&["a", "b", "c", "d", "e", "f"]);
        let vectors = embed_all(Arc::clone(&client), &input, 3, 1).await;

        assert_eq!(vectors.len(), 6);
        assert!(vectors.iter().all(Option::is_none));
        // Per batch: the batch request plus one single-item request.
        assert_eq!(client.requests.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn mismatched_dimensions_are_dropped() {
        let client = Arc::new(RecordingEmbedder {
            ragged: HashSet::from(["odd".to_string()]),
            ..Default::default()
        });
        let input = texts(&["first", "odd", "third"]);
        let vectors = embed_all(client, &input, 1, 3).await;

        assert!(vectors[0].is_some());
        assert!(vectors[1].is_none());
        assert!(vectors[2].is_some());
    }

    #[tokio::test]
    async fn empty_input_makes_no_requests() {
        let client = Arc::new(RecordingEmbedder::default());
        let vectors = embed_all(Arc::clone(&client), &[], 4, 4).await;
        assert!(vectors.is_empty());
        assert!(client.requests.lock().unwrap().is_empty());
    }
}
