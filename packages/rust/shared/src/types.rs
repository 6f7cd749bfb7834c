//! Core domain types shared by the pipeline stages.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// StageName
// ---------------------------------------------------------------------------

/// One unit of the daily pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Metrics,
    Ingest,
    Preprocess,
    Cluster,
    Enrich,
    Report,
}

impl StageName {
    /// The fixed stage sequence executed by the orchestrator.
    pub const SEQUENCE: [StageName; 6] = [
        StageName::Metrics,
        StageName::Ingest,
        StageName::Preprocess,
        StageName::Cluster,
        StageName::Enrich,
        StageName::Report,
    ];

    /// Stable identifier used in config keys, CLI arguments and the run log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Metrics => "metrics",
            Self::Ingest => "ingest",
            Self::Preprocess => "preprocess",
            Self::Cluster => "cluster",
            Self::Enrich => "enrich",
            Self::Report => "report",
        }
    }

    /// Whether the `marketbrief stage` subcommand implements this stage.
    pub fn is_builtin(&self) -> bool {
        !matches!(self, Self::Metrics | Self::Ingest)
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::SEQUENCE
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// NormalizedEntry
// ---------------------------------------------------------------------------

/// A cleaned news item, one JSON object per line in `normalized/<date>.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEntry {
    /// Upstream identifier, unique within a date.
    pub item_id: String,
    /// Headline.
    pub title: String,
    /// Body text with markup stripped.
    #[serde(default, alias = "text")]
    pub clean_text: String,
    /// Feed or publisher name.
    #[serde(default)]
    pub source: Option<String>,
    /// Publication time in the configured offset.
    #[serde(default)]
    pub published_at: Option<DateTime<FixedOffset>>,
    /// Link to the original article.
    #[serde(default)]
    pub url: Option<String>,
}

// ---------------------------------------------------------------------------
// TopicCluster
// ---------------------------------------------------------------------------

/// A member article as listed inside a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicItem {
    pub title: String,
    pub source: Option<String>,
    pub url: Option<String>,
    /// Short excerpt of the cleaned text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

/// One topic for a date, as written to `topics/<date>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicCluster {
    /// `<date>-<seq>`, e.g. `2026-10-17-003`.
    pub topic_id: String,
    pub title: String,
    pub representative_text: String,
    /// True membership, which may exceed `items.len()`.
    pub count: usize,
    pub items: Vec<TopicItem>,
    pub single_article: bool,
}

impl TopicCluster {
    /// Build a topic, deriving `single_article` from `count`.
    pub fn new(
        topic_id: String,
        title: String,
        representative_text: String,
        count: usize,
        items: Vec<TopicItem>,
    ) -> Self {
        Self {
            topic_id,
            title,
            representative_text,
            count,
            items,
            single_article: count == 1,
        }
    }
}

/// Format a topic id from the run date and a 1-based sequence number.
pub fn topic_id(date: chrono::NaiveDate, seq: usize) -> String {
    format!("{}-{seq:03}", date.format("%Y-%m-%d"))
}

// ---------------------------------------------------------------------------
// ResearchRow
// ---------------------------------------------------------------------------

/// Per-topic research produced by the enrich stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRow {
    pub topic_id: String,
    pub topic_title: String,
    pub summary: String,
    pub market_impact: String,
    /// 0 (very bearish) to 10 (very bullish).
    pub sentiment: u8,
    pub watch_symbols: Vec<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
    pub source_count: usize,
    #[serde(default)]
    pub sources: Vec<String>,
}
