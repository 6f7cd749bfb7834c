//! Concurrent topic labeling with sanitizing and fallback titles.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use marketbrief_inference::LabelingClient;

use crate::text::{collapse_whitespace, truncate_chars};

/// Characters stripped from both ends of a model-produced title.
const TITLE_TRIM: &[char] = &['"', '\'', '`', '“', '”', '‘', '’', '*', '#'];

/// One labeling job.
#[derive(Debug, Clone)]
pub struct LabelRequest {
    /// Prompt context, usually a list of member titles.
    pub context: String,
    /// Title used when the labeler fails or replies with nothing usable.
    pub fallback: String,
}

/// A resolved title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub title: String,
    pub fallback_used: bool,
}

/// Clean up a raw reply: first non-empty line, quotes stripped, length capped.
pub fn sanitize_title(raw: &str, max_chars: usize) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.strip_prefix("Title:").unwrap_or(line);
    let cleaned = collapse_whitespace(line.trim().trim_matches(TITLE_TRIM));
    if cleaned.is_empty() {
        return None;
    }
    Some(truncate_chars(&cleaned, max_chars))
}

/// Label every request on at most `max_concurrency` tasks.
///
/// Results are returned in request order. Labeling never fails the run.
#[instrument(skip_all, fields(requests = requests.len(), max_concurrency))]
pub async fn label_all<L: LabelingClient>(
    client: Arc<L>,
    requests: Vec<LabelRequest>,
    max_concurrency: usize,
    title_max_chars: usize,
) -> Vec<Label> {
    let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
    let mut handles = Vec::with_capacity(requests.len());
    let fallbacks: Vec<String> = requests
        .iter()
        .map(|r| truncate_chars(&r.fallback, title_max_chars))
        .collect();

    for request in requests {
        let client = Arc::clone(&client);
        let sem = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok()?;
            match client.label(&request.context).await {
                Ok(raw) => {
                    let title = sanitize_title(&raw, title_max_chars);
                    if title.is_none() {
                        warn!("labeler returned an empty title");
                    }
                    title
                }
                Err(e) => {
                    warn!(error = %e, "labeling failed, using fallback title");
                    None
                }
            }
        }));
    }

    let mut labels = Vec::with_capacity(handles.len());
    for (handle, fallback) in handles.into_iter().zip(fallbacks) {
        let title = match handle.await {
            Ok(title) => title,
            Err(e) => {
                warn!(error = %e, "labeling task panicked");
                None
            }
        };
        labels.push(match title {
            Some(title) => Label {
                title,
                fallback_used: false,
            },
            None => Label {
                title: fallback,
                fallback_used: true,
            },
        });
    }
    labels
}
