//! The clustering sub-pipeline: dedup → embed → partition → label → ids.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, instrument, warn};

use marketbrief_inference::{EmbeddingClient, LabelingClient};
use marketbrief_shared::{ClusterConfig, NormalizedEntry, TopicCluster, TopicItem, topic_id};

use crate::embedding::embed_all;
use crate::labeling::{LabelRequest, label_all};
use crate::partition::{PartitionPolicy, member_similarities, partition};
use crate::similarity::normalize;
use crate::text::{collapse_whitespace, snippet, truncate_chars};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Topics for one date plus run statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterOutcome {
    pub topics: Vec<TopicCluster>,
    /// Every embedding failed; each item became its own topic.
    pub degraded: bool,
    /// Entries received, before dedup.
    pub entries: usize,
    pub duplicates: usize,
    pub embedded: usize,
    /// Item ids excluded because they could not be embedded.
    pub unembedded: Vec<String>,
    pub threshold: f32,
    pub relaxations: u32,
    pub singleton_merges: usize,
    pub forced_merges: usize,
    pub label_fallbacks: usize,
}

/// The statistics of a [`ClusterOutcome`], as logged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
    pub degraded: bool,
    pub entries: usize,
    pub duplicates: usize,
    pub embedded: usize,
    pub unembedded: Vec<String>,
    pub topics: usize,
    pub threshold: f32,
    pub relaxations: u32,
    pub singleton_merges: usize,
    pub forced_merges: usize,
    pub label_fallbacks: usize,
}

impl ClusterOutcome {
    fn empty(entries: usize, duplicates: usize, threshold: f32) -> Self {
        Self {
            topics: Vec::new(),
            degraded: false,
            entries,
            duplicates,
            embedded: 0,
            unembedded: Vec::new(),
            threshold,
            relaxations: 0,
            singleton_merges: 0,
            forced_merges: 0,
            label_fallbacks: 0,
        }
    }

    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            degraded: self.degraded,
            entries: self.entries,
            duplicates: self.duplicates,
            embedded: self.embedded,
            unembedded: self.unembedded.clone(),
            topics: self.topics.len(),
            threshold: self.threshold,
            relaxations: self.relaxations,
            singleton_merges: self.singleton_merges,
            forced_merges: self.forced_merges,
            label_fallbacks: self.label_fallbacks,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Groups a day's entries into labeled topics.
pub struct ClusterEngine<E, L> {
    embedder: Arc<E>,
    labeler: Arc<L>,
    config: ClusterConfig,
}

/// A topic before ids are assigned.
struct Draft {
    first_seen: usize,
    count: usize,
    title: Option<String>,
    representative_text: String,
    items: Vec<TopicItem>,
    label_context: String,
}

impl<E: EmbeddingClient, L: LabelingClient> ClusterEngine<E, L> {
    pub fn new(embedder: Arc<E>, labeler: Arc<L>, config: ClusterConfig) -> Self {
        Self {
            embedder,
            labeler,
            config,
        }
    }

    /// Cluster `entries` for `date`. Never fails: upstream errors degrade.
    #[instrument(skip_all, fields(date = %date, entries = entries.len()))]
    pub async fn cluster(&self, date: NaiveDate, entries: Vec<NormalizedEntry>) -> ClusterOutcome {
        let start = Instant::now();
        let cfg = &self.config;
        let received = entries.len();
        let policy = PartitionPolicy::from(cfg);
        let initial_threshold = policy
            .threshold
            .clamp(policy.threshold_min, policy.threshold_max);

        let entries = order_entries(dedup_entries(entries));
        let duplicates = received - entries.len();
        if entries.is_empty() {
            info!(received, duplicates, "no entries to cluster");
            return ClusterOutcome::empty(received, duplicates, initial_threshold);
        }

        let texts: Vec<String> = entries.iter().map(|e| embed_text(e, cfg.embed_text_chars)).collect();
        let raw = embed_all(
            Arc::clone(&self.embedder),
            &texts,
            cfg.embed_batch_size,
            cfg.max_concurrency,
        )
        .await;

        let mut kept: Vec<&NormalizedEntry> = Vec::new();
        let mut vectors: Vec<Vec<f32>> = Vec::new();
        let mut unembedded = Vec::new();
        for (entry, vector) in entries.iter().zip(raw) {
            match vector {
                Some(v) => {
                    kept.push(entry);
                    vectors.push(normalize(&v));
                }
                None => unembedded.push(entry.item_id.clone()),
            }
        }

        if kept.is_empty() {
            warn!(
                entries = entries.len(),
                "all embeddings failed, emitting one topic per entry"
            );
            let topics = self.singletons(date, &entries);
            return ClusterOutcome {
                topics,
                degraded: true,
                unembedded,
                ..ClusterOutcome::empty(received, duplicates, initial_threshold)
            };
        }

        let parts = partition(&vectors, &policy);

        let mut drafts: Vec<Draft> = parts
            .groups
            .iter()
            .map(|group| {
                let mut ranked = member_similarities(group, &vectors);
                ranked.sort_by(|(ia, sa), (ib, sb)| sb.total_cmp(sa).then(ia.cmp(ib)));
                let items: Vec<TopicItem> = ranked
                    .iter()
                    .take(cfg.max_items_per_topic)
                    .map(|&(m, _)| self.topic_item(kept[m]))
                    .collect();

                // Members are in processing order; the last is the most recent.
                let latest = group.members[group.len() - 1];
                let representative_text = self.representative(kept[latest]);

                let label_context = items
                    .iter()
                    .take(cfg.label_context_titles)
                    .map(|item| format!("- {}", item.title))
                    .collect::<Vec<_>>()
                    .join("\n");

                let title = (group.len() == 1).then(|| kept[group.members[0]].title.clone());
                Draft {
                    first_seen: group.members[0],
                    count: group.len(),
                    title,
                    representative_text,
                    items,
                    label_context,
                }
            })
            .collect();

        let pending: Vec<usize> = (0..drafts.len()).filter(|&i| drafts[i].title.is_none()).collect();
        let requests = pending
            .iter()
            .map(|&i| LabelRequest {
                context: drafts[i].label_context.clone(),
                fallback: drafts[i].representative_text.clone(),
            })
            .collect();
        let labels = label_all(
            Arc::clone(&self.labeler),
            requests,
            cfg.max_concurrency,
            cfg.title_max_chars,
        )
        .await;
        let label_fallbacks = labels.iter().filter(|l| l.fallback_used).count();
        for (i, label) in pending.into_iter().zip(labels) {
            drafts[i].title = Some(label.title);
        }

        let topics = assign_ids(date, drafts);
        let outcome = ClusterOutcome {
            topics,
            degraded: false,
            entries: received,
            duplicates,
            embedded: kept.len(),
            unembedded,
            threshold: parts.threshold,
            relaxations: parts.relaxations,
            singleton_merges: parts.singleton_merges,
            forced_merges: parts.forced_merges,
            label_fallbacks,
        };

        info!(
            topics = outcome.topics.len(),
            embedded = outcome.embedded,
            unembedded = outcome.unembedded.len(),
            threshold = outcome.threshold,
            relaxations = outcome.relaxations,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "clustering complete"
        );
        outcome
    }

    /// One topic per entry, in processing order. Used when nothing embedded.
    fn singletons(&self, date: NaiveDate, entries: &[NormalizedEntry]) -> Vec<TopicCluster> {
        let drafts = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| Draft {
                first_seen: i,
                count: 1,
                title: Some(entry.title.clone()),
                representative_text: self.representative(entry),
                items: vec![self.topic_item(entry)],
                label_context: String::new(),
            })
            .collect();
        assign_ids(date, drafts)
    }

    fn topic_item(&self, entry: &NormalizedEntry) -> TopicItem {
        TopicItem {
            title: entry.title.clone(),
            source: entry.source.clone(),
            url: entry.url.clone(),
            snippet: snippet(&entry.clean_text, self.config.snippet_max_chars),
        }
    }

    fn representative(&self, entry: &NormalizedEntry) -> String {
        snippet(&entry.clean_text, self.config.snippet_max_chars)
            .unwrap_or_else(|| truncate_chars(&entry.title, self.config.snippet_max_chars))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Keep the first entry per `(normalized title, source)`.
fn dedup_entries(entries: Vec<NormalizedEntry>) -> Vec<NormalizedEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| {
            let key = (collapse_whitespace(&e.title).to_lowercase(), e.source.clone());
            seen.insert(key)
        })
        .collect()
}

/// Oldest first, undated last, ties by item id.
fn order_entries(mut entries: Vec<NormalizedEntry>) -> Vec<NormalizedEntry> {
    entries.sort_by(|a, b| {
        (a.published_at.is_none(), a.published_at, &a.item_id).cmp(&(
            b.published_at.is_none(),
            b.published_at,
            &b.item_id,
        ))
    });
    entries
}

/// Title plus a prefix of the body.
fn embed_text(entry: &NormalizedEntry, max_chars: usize) -> String {
    let body: String = entry.clean_text.chars().take(max_chars).collect();
    format!("{}\n{}", entry.title, body)
}

/// Order by count (desc) then first-seen, and number from 1.
fn assign_ids(date: NaiveDate, mut drafts: Vec<Draft>) -> Vec<TopicCluster> {
    drafts.sort_by(|a, b| b.count.cmp(&a.count).then(a.first_seen.cmp(&b.first_seen)));
    drafts
        .into_iter()
        .enumerate()
        .map(|(i, d)| {
            TopicCluster::new(
                topic_id(date, i + 1),
                d.title.unwrap_or_default(),
                d.representative_text,
                d.count,
                d.items,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{DateTime, FixedOffset};

    use super::*;
    use marketbrief_inference::InferenceError;

    // -----------------------------------------------------------------------
    // Fakes
    // -----------------------------------------------------------------------

    /// Looks vectors up by the first line of the text (the title).
    #[derive(Default)]
    struct TableEmbedder {
        table: HashMap<String, Vec<f32>>,
        fail_all: bool,
        failing: HashSet<String>,
        calls: AtomicUsize,
    }

    impl TableEmbedder {
        fn with(rows: &[(&str, &[f32])]) -> Self {
            Self {
                table: rows.iter().map(|(t, v)| (t.to_string(), v.to_vec())).collect(),
                ..Default::default()
            }
        }
    }

    fn unavailable() -> InferenceError {
        InferenceError::Status {
            endpoint: "mock".into(),
            status: 503,
            body: "down".into(),
        }
    }

    impl EmbeddingClient for TableEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_all {
                return Err(unavailable());
            }
            texts
                .iter()
                .map(|text| {
                    let title = text.lines().next().unwrap_or_default();
                    if self.failing.contains(title) {
                        return Err(unavailable());
                    }
                    self.table.get(title).cloned().ok_or_else(unavailable)
                })
                .collect()
        }
    }

    struct CountingLabeler {
        reply: Option<String>,
        calls: AtomicUsize,
        contexts: std::sync::Mutex<Vec<String>>,
    }

    impl CountingLabeler {
        fn replying(reply: &str) -> Self {
            Self {
                reply: Some(reply.to_string()),
                calls: AtomicUsize::new(0),
                contexts: Default::default(),
            }
        }

        fn failing() -> Self {
            Self {
                reply: None,
                calls: AtomicUsize::new(0),
                contexts: Default::default(),
            }
        }
    }

    impl LabelingClient for CountingLabeler {
        async fn label(&self, context: &str) -> Result<String, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.contexts.lock().unwrap().push(context.to_string());
            self.reply.clone().ok_or_else(unavailable)
        }
    }

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    }

    fn at(hour: u32) -> Option<DateTime<FixedOffset>> {
        Some(
            DateTime::parse_from_rfc3339(&format!("2026-10-17T{hour:02}:00:00+00:00")).unwrap(),
        )
    }

    fn entry(id: &str, title: &str, text: &str, hour: u32) -> NormalizedEntry {
        NormalizedEntry {
            item_id: id.into(),
            title: title.into(),
            clean_text: text.into(),
            source: Some("Wire".into()),
            published_at: at(hour),
            url: Some(format!("https://news.example.com/{id}")),
        }
    }

    const A: &[f32] = &[1.0, 0.0, 0.0, 0.0];
    const B: &[f32] = &[0.98, 0.2, 0.0, 0.0];
    const C: &[f32] = &[0.97, 0.15, 0.1, 0.0];
    const D: &[f32] = &[0.0, 0.0, 0.0, 1.0];
    const E: &[f32] = &[0.0, 0.0, 1.0, 0.0];

    fn five_entries() -> Vec<NormalizedEntry> {
        vec![
            entry("a", "Fed holds rates", "The Fed kept rates unchanged.", 1),
            entry("b", "Fed pauses hikes", "Policy makers paused.", 2),
            entry("c", "Powell signals patience", "Chair Powell spoke.", 3),
            entry("d", "Oil slides on supply", "Crude fell 3%.", 4),
            entry("e", "Chipmaker beats estimates", "Revenue rose.", 5),
        ]
    }

    fn five_vectors() -> TableEmbedder {
        TableEmbedder::with(&[
            ("Fed holds rates", A),
            ("Fed pauses hikes", B),
            ("Powell signals patience", C),
            ("Oil slides on supply", D),
            ("Chipmaker beats estimates", E),
        ])
    }

    fn engine<Emb: EmbeddingClient, Lab: LabelingClient>(
        embedder: Emb,
        labeler: Lab,
        config: ClusterConfig,
    ) -> (ClusterEngine<Emb, Lab>, Arc<Emb>, Arc<Lab>) {
        let embedder = Arc::new(embedder);
        let labeler = Arc::new(labeler);
        (
            ClusterEngine::new(Arc::clone(&embedder), Arc::clone(&labeler), config),
            embedder,
            labeler,
        )
    }

    fn total(outcome: &ClusterOutcome) -> usize {
        outcome.topics.iter().map(|t| t.count).sum()
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn near_duplicates_form_one_topic() {
        let (engine, _, labeler) = engine(
            five_vectors(),
            CountingLabeler::replying("Fed Policy Outlook"),
            ClusterConfig::default(),
        );
        let outcome = engine.cluster(date(), five_entries()).await;

        assert!(!outcome.degraded);
        let counts: Vec<usize> = outcome.topics.iter().map(|t| t.count).collect();
        assert_eq!(counts, vec![3, 1, 1]);
        assert_eq!(total(&outcome), 5);

        let ids: Vec<&str> = outcome.topics.iter().map(|t| t.topic_id.as_str()).collect();
        assert_eq!(ids, ["2026-10-17-001", "2026-10-17-002", "2026-10-17-003"]);

        assert_eq!(outcome.topics[0].title, "Fed Policy Outlook");
        assert!(!outcome.topics[0].single_article);
        assert_eq!(outcome.topics[0].representative_text, "Chair Powell spoke.");
        assert_eq!(outcome.topics[1].title, "Oil slides on supply");
        assert!(outcome.topics[1].single_article);
        assert_eq!(outcome.topics[2].title, "Chipmaker beats estimates");

        // Singletons never reach the labeler.
        assert_eq!(labeler.calls.load(Ordering::SeqCst), 1);
        let contexts = labeler.contexts.lock().unwrap();
        assert!(contexts[0].lines().all(|l| l.starts_with("- ")));
        assert_eq!(contexts[0].lines().count(), 3);
    }

    #[tokio::test]
    async fn all_embeddings_failing_degrades_to_singletons() {
        let embedder = TableEmbedder {
            fail_all: true,
            ..five_vectors()
        };
        let (engine, _, labeler) =
            engine(embedder, CountingLabeler::replying("unused"), ClusterConfig::default());
        let outcome = engine.cluster(date(), five_entries()).await;

        assert!(outcome.degraded);
        assert_eq!(outcome.topics.len(), 5);
        assert_eq!(outcome.embedded, 0);
        assert_eq!(outcome.unembedded.len(), 5);
        assert!(outcome.topics.iter().all(|t| t.count == 1 && t.single_article));
        let titles: Vec<&str> = outcome.topics.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(
            titles,
            [
                "Fed holds rates",
                "Fed pauses hikes",
                "Powell signals patience",
                "Oil slides on supply",
                "Chipmaker beats estimates"
            ]
        );
        assert_eq!(labeler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unembeddable_items_are_reported_not_clustered() {
        let embedder = TableEmbedder {
            failing: HashSet::from(["Oil slides on supply".to_string()]),
            ..five_vectors()
        };
        let (engine, _, _) =
            engine(embedder, CountingLabeler::replying("Fed"), ClusterConfig::default());
        let outcome = engine.cluster(date(), five_entries()).await;

        assert!(!outcome.degraded);
        assert_eq!(outcome.embedded, 4);
        assert_eq!(outcome.unembedded, vec!["d".to_string()]);
        assert_eq!(total(&outcome), outcome.embedded);
        assert_eq!(outcome.topics.len(), 2);
    }

    #[tokio::test]
    async fn failed_labeling_falls_back_to_representative_text() {
        let config = ClusterConfig {
            title_max_chars: 10,
            ..ClusterConfig::default()
        };
        let (engine, _, _) = engine(five_vectors(), CountingLabeler::failing(), config);
        let outcome = engine.cluster(date(), five_entries()).await;

        assert_eq!(outcome.label_fallbacks, 1);
        assert_eq!(outcome.topics[0].title, "Chair Powe");
        assert_eq!(outcome.topics[1].title, "Oil slides on supply");
    }

    #[tokio::test]
    async fn items_are_capped_but_count_is_true_total() {
        let config = ClusterConfig {
            max_items_per_topic: 2,
            ..ClusterConfig::default()
        };
        let (engine, _, _) = engine(five_vectors(), CountingLabeler::replying("Fed"), config);
        let outcome = engine.cluster(date(), five_entries()).await;

        let top = &outcome.topics[0];
        assert_eq!(top.count, 3);
        assert_eq!(top.items.len(), 2);
        assert_eq!(total(&outcome), 5);
    }

    #[tokio::test]
    async fn duplicate_titles_from_same_source_are_dropped() {
        let mut entries = five_entries();
        entries.push(entry("a2", "  FED holds   rates ", "Repost.", 6));
        let mut other_source = entry("a3", "Fed holds rates", "Elsewhere.", 7);
        other_source.source = Some("Other Wire".into());
        entries.push(other_source);

        let (engine, _, _) =
            engine(five_vectors(), CountingLabeler::replying("Fed"), ClusterConfig::default());
        let outcome = engine.cluster(date(), entries).await;

        assert_eq!(outcome.entries, 7);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.embedded, 6);
        assert_eq!(outcome.topics[0].count, 4);
    }

    #[tokio::test]
    async fn topic_count_never_exceeds_budget() {
        let entries: Vec<NormalizedEntry> = (0..12)
            .map(|i| entry(&format!("n{i:02}"), &format!("Story {i}"), "", i))
            .collect();
        let rows: Vec<(String, Vec<f32>)> = (0..12)
            .map(|i| {
                let mut v = vec![0.0; 12];
                v[i] = 1.0;
                (format!("Story {i}"), v)
            })
            .collect();
        let embedder = TableEmbedder {
            table: rows.into_iter().collect(),
            ..Default::default()
        };
        let config = ClusterConfig {
            max_topics: 4,
            ..ClusterConfig::default()
        };
        let (engine, _, _) = engine(embedder, CountingLabeler::replying("Mixed"), config);
        let outcome = engine.cluster(date(), entries).await;

        assert!(outcome.topics.len() <= 4);
        assert_eq!(total(&outcome), 12);
        assert!(outcome.forced_merges > 0);
        assert!(outcome.topics.iter().all(|t| t.single_article == (t.count == 1)));
    }

    #[tokio::test]
    async fn identical_input_gives_identical_topics() {
        let (engine, _, _) =
            engine(five_vectors(), CountingLabeler::replying("Fed"), ClusterConfig::default());
        let mut shuffled = five_entries();
        shuffled.reverse();

        let first = engine.cluster(date(), five_entries()).await;
        let second = engine.cluster(date(), shuffled).await;
        assert_eq!(first.topics, second.topics);
    }

    #[tokio::test]
    async fn empty_input_is_an_empty_result() {
        let (engine, embedder, _) =
            engine(five_vectors(), CountingLabeler::replying("x"), ClusterConfig::default());
        let outcome = engine.cluster(date(), Vec::new()).await;

        assert!(outcome.topics.is_empty());
        assert!(!outcome.degraded);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn undated_entries_sort_last() {
        let mut undated = entry("0", "Undated", "", 0);
        undated.published_at = None;
        let ordered = order_entries(vec![undated, entry("z", "Late", "", 9), entry("y", "Early", "", 1)]);
        let ids: Vec<&str> = ordered.iter().map(|e| e.item_id.as_str()).collect();
        assert_eq!(ids, ["y", "z", "0"]);
    }

    #[test]
    fn summary_serializes_statistics() {
        let outcome = ClusterOutcome::empty(3, 1, 0.82);
        let json = serde_json::to_value(outcome.summary()).unwrap();
        assert_eq!(json["entries"], 3);
        assert_eq!(json["duplicates"], 1);
        assert_eq!(json["topics"], 0);
        assert_eq!(json["degraded"], false);
    }
}
