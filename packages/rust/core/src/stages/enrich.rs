//! `enrich`: per-topic market research via chat completion.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use marketbrief_inference::{ChatMessage, InferenceClient};
use marketbrief_shared::{EnrichConfig, MarketBriefError, ResearchRow, Result, TopicCluster};

use crate::stages::StageContext;
use crate::store::{ArtifactMeta, read_json_opt, write_jsonl};

/// Most source URLs kept per row.
const MAX_SOURCES: usize = 10;

/// Most watch symbols kept per row.
const MAX_SYMBOLS: usize = 5;

const NOT_AVAILABLE: &str = "N/A";
const NEUTRAL_SENTIMENT: u8 = 5;

const SYSTEM_PROMPT: &str = "You are a markets analyst. Given a news topic and its articles, \
reply with a single JSON object and nothing else, with keys: \
\"summary\" (2-3 sentences), \"market_impact\" (1-2 sentences), \
\"sentiment\" (integer 0 = very bearish to 10 = very bullish), \
\"watch_symbols\" (array of up to 5 ticker symbols), \
\"recommendation\" (one sentence).";

pub async fn run(ctx: &StageContext) -> Result<ArtifactMeta> {
    let client = Arc::new(InferenceClient::new(&ctx.config.inference)?);
    enrich_with(ctx, client).await
}

#[instrument(skip_all, fields(date = %ctx.date))]
pub async fn enrich_with(ctx: &StageContext, client: Arc<InferenceClient>) -> Result<ArtifactMeta> {
    let path = ctx.layout.topics(ctx.date);
    let topics: Vec<TopicCluster> = read_json_opt(&path)?.ok_or_else(|| {
        MarketBriefError::validation(format!(
            "{} not found; run the cluster stage first",
            path.display()
        ))
    })?;

    let rows = enrich_topics(client, topics, &ctx.config.enrich).await;
    let defaults = rows.iter().filter(|r| r.summary == NOT_AVAILABLE).count();
    info!(rows = rows.len(), defaults, "research complete");

    let meta = write_jsonl(&ctx.layout.research(ctx.date), &rows)?;
    ctx.artifact_written(&meta);
    Ok(meta)
}

/// Research every topic on a bounded pool. Output follows topic order.
pub async fn enrich_topics(
    client: Arc<InferenceClient>,
    topics: Vec<TopicCluster>,
    config: &EnrichConfig,
) -> Vec<ResearchRow> {
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let mut handles = Vec::with_capacity(topics.len());

    for topic in &topics {
        let client = Arc::clone(&client);
        let sem = Arc::clone(&semaphore);
        let messages = build_messages(topic, config);
        let topic_id = topic.topic_id.clone();
        handles.push(tokio::spawn(async move {
            let _permit = sem.acquire_owned().await.ok()?;
            match client.chat(&messages).await {
                Ok(reply) => Some(reply),
                Err(e) => {
                    warn!(topic_id = %topic_id, error = %e, "research request failed");
                    None
                }
            }
        }));
    }

    let mut rows = Vec::with_capacity(topics.len());
    for (handle, topic) in handles.into_iter().zip(&topics) {
        let reply = handle.await.ok().flatten();
        let row = reply
            .as_deref()
            .and_then(|r| parse_research(topic, r))
            .unwrap_or_else(|| {
                debug!(topic_id = %topic.topic_id, "using default research row");
                default_row(topic)
            });
        rows.push(row);
    }
    rows
}

/// System + user messages for one topic.
pub fn build_messages(topic: &TopicCluster, config: &EnrichConfig) -> Vec<ChatMessage> {
    let mut user = format!(
        "Topic: {}\nArticles ({} total):\n",
        topic.title, topic.count
    );
    for item in topic.items.iter().take(config.items_per_topic) {
        let source = item.source.as_deref().unwrap_or("unknown source");
        user.push_str(&format!("- {} ({source})", item.title));
        if let Some(snippet) = &item.snippet {
            let snippet: String = snippet.chars().take(config.snippet_chars).collect();
            user.push_str(&format!(": {snippet}"));
        }
        user.push('\n');
    }
    vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)]
}

/// Extract and coerce the first `{...}` object in `reply`.
pub fn parse_research(topic: &TopicCluster, reply: &str) -> Option<ResearchRow> {
    static OBJECT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

    let block = OBJECT_RE.find(reply)?;
    let value: Value = serde_json::from_str(block.as_str()).ok()?;
    let object = value.as_object()?;

    let text = |key: &str| {
        object
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let watch_symbols = match object.get("watch_symbols") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .take(MAX_SYMBOLS)
            .collect(),
        _ => Vec::new(),
    };

    Some(ResearchRow {
        summary: text("summary").unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        market_impact: text("market_impact").unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        sentiment: object.get("sentiment").map_or(NEUTRAL_SENTIMENT, coerce_sentiment),
        watch_symbols,
        recommendation: text("recommendation"),
        ..default_row(topic)
    })
}

/// Row used when research is unavailable.
pub fn default_row(topic: &TopicCluster) -> ResearchRow {
    ResearchRow {
        topic_id: topic.topic_id.clone(),
        topic_title: topic.title.clone(),
        summary: NOT_AVAILABLE.to_string(),
        market_impact: NOT_AVAILABLE.to_string(),
        sentiment: NEUTRAL_SENTIMENT,
        watch_symbols: Vec::new(),
        recommendation: None,
        source_count: topic.count,
        sources: topic
            .items
            .iter()
            .filter_map(|item| item.url.clone())
            .take(MAX_SOURCES)
            .collect(),
    }
}

/// Integer in 0..=10 from a number or numeric string.
fn coerce_sentiment(value: &Value) -> u8 {
    let raw = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match raw {
        Some(x) if x.is_finite() => x.round().clamp(0.0, 10.0) as u8,
        _ => NEUTRAL_SENTIMENT,
    }
}
