//! `cluster`: normalized entries → `topics/<date>.json`.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use marketbrief_clustering::{ClusterEngine, ClusterOutcome};
use marketbrief_inference::{EmbeddingClient, InferenceClient, LabelingClient};
use marketbrief_shared::{ClusterConfig, NormalizedEntry, Result};

use crate::run_log::RunEvent;
use crate::stages::StageContext;
use crate::store::{read_jsonl, write_json};

/// Run the stage against the configured inference endpoint.
pub async fn run(ctx: &StageContext) -> Result<ClusterOutcome> {
    let client = Arc::new(InferenceClient::new(&ctx.config.inference)?);
    cluster_with(ctx, Arc::clone(&client), client).await
}

/// Run the stage with explicit clients.
#[instrument(skip_all, fields(date = %ctx.date))]
pub async fn cluster_with<E: EmbeddingClient, L: LabelingClient>(
    ctx: &StageContext,
    embedder: Arc<E>,
    labeler: Arc<L>,
) -> Result<ClusterOutcome> {
    let config = ClusterConfig::from(&ctx.config);
    config.validate()?;

    let input = ctx.layout.normalized(ctx.date);
    let entries: Vec<NormalizedEntry> = read_jsonl(&input)?.unwrap_or_default();
    if entries.is_empty() {
        warn!(path = %input.display(), "no normalized entries, writing empty topic list");
    }

    let engine = ClusterEngine::new(embedder, labeler, config);
    let outcome = engine.cluster(ctx.date, entries).await;

    let meta = write_json(&ctx.layout.topics(ctx.date), &outcome.topics)?;
    ctx.artifact_written(&meta);

    let summary = outcome.summary();
    if summary.degraded {
        warn!(topics = summary.topics, "clustering degraded: embeddings unavailable");
    }
    info!(
        topics = summary.topics,
        embedded = summary.embedded,
        unembedded = summary.unembedded.len(),
        duplicates = summary.duplicates,
        "topics written"
    );
    ctx.log.record(&RunEvent::ClusterSummary(summary));

    Ok(outcome)
}
