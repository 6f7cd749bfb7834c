//! `report`: topics, research and metrics → `reports/<date>.md`.

use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::NaiveDate;
use serde_json::Value;
use tracing::{info, instrument, warn};

use marketbrief_shared::{MarketBriefError, ResearchRow, Result, TopicCluster, date_key};

use crate::stages::StageContext;
use crate::store::{ArtifactMeta, read_json_opt, read_jsonl, write_atomic};

#[instrument(skip_all, fields(date = %ctx.date))]
pub fn run(ctx: &StageContext) -> Result<ArtifactMeta> {
    let topics_path = ctx.layout.topics(ctx.date);
    let topics: Vec<TopicCluster> = read_json_opt(&topics_path)?.ok_or_else(|| {
        MarketBriefError::validation(format!(
            "{} not found; run the cluster stage first",
            topics_path.display()
        ))
    })?;

    let research: Vec<ResearchRow> = read_jsonl(&ctx.layout.research(ctx.date))?.unwrap_or_else(|| {
        warn!("no research for date, report will use topic text only");
        Vec::new()
    });
    let metrics: Option<Value> = read_json_opt(&ctx.layout.metrics(ctx.date))?;
    if metrics.is_none() {
        warn!("no metrics snapshot for date");
    }

    let markdown = render(ctx.date, &topics, &research, metrics.as_ref());
    let meta = write_atomic(&ctx.layout.report(ctx.date), markdown.as_bytes())?;
    info!(topics = topics.len(), research = research.len(), "report rendered");
    ctx.artifact_written(&meta);
    Ok(meta)
}

/// Render the daily brief as Markdown.
pub fn render(
    date: NaiveDate,
    topics: &[TopicCluster],
    research: &[ResearchRow],
    metrics: Option<&Value>,
) -> String {
    let by_topic: HashMap<&str, &ResearchRow> =
        research.iter().map(|row| (row.topic_id.as_str(), row)).collect();

    let mut out = String::new();
    let _ = writeln!(out, "# Market Brief: {}\n", date_key(date));

    out.push_str("## Market Snapshot\n\n");
    render_metrics(&mut out, metrics);

    out.push_str("\n## Top Stories\n");
    if topics.is_empty() {
        out.push_str("\n_No topics for this date._\n");
    }
    for (i, topic) in topics.iter().enumerate() {
        render_topic(&mut out, i + 1, topic, by_topic.get(topic.topic_id.as_str()).copied());
    }
    out
}

fn render_metrics(out: &mut String, metrics: Option<&Value>) {
    let rows: Vec<(&String, String)> = metrics
        .and_then(Value::as_object)
        .map(|object| {
            object
                .iter()
                .filter_map(|(key, value)| scalar(value).map(|v| (key, v)))
                .collect()
        })
        .unwrap_or_default();

    if rows.is_empty() {
        out.push_str("_No metrics available._\n");
        return;
    }
    out.push_str("| Metric | Value |\n|---|---|\n");
    for (key, value) in rows {
        let _ = writeln!(out, "| {} | {} |", escape_cell(key), escape_cell(&value));
    }
}

fn render_topic(out: &mut String, n: usize, topic: &TopicCluster, research: Option<&ResearchRow>) {
    let articles = if topic.count == 1 { "article" } else { "articles" };
    let _ = writeln!(out, "\n### {n}. {}\n", topic.title);
    let _ = writeln!(out, "_{} {articles}_\n", topic.count);

    let summary = research
        .map(|r| r.summary.as_str())
        .filter(|s| !s.is_empty() && *s != "N/A")
        .unwrap_or(topic.representative_text.as_str());
    let _ = writeln!(out, "{summary}\n");

    if let Some(row) = research {
        let _ = writeln!(out, "- **Market impact:** {}", row.market_impact);
        let _ = writeln!(out, "- **Sentiment:** {}/10", row.sentiment);
        if !row.watch_symbols.is_empty() {
            let _ = writeln!(out, "- **Watch:** {}", row.watch_symbols.join(", "));
        }
        if let Some(rec) = &row.recommendation {
            let _ = writeln!(out, "- **Recommendation:** {rec}");
        }
    }

    let links: Vec<String> = topic
        .items
        .iter()
        .filter_map(|item| {
            let url = item.url.as_deref()?;
            Some(match &item.source {
                Some(source) => format!("- [{}]({url}) ({source})", item.title),
                None => format!("- [{}]({url})", item.title),
            })
        })
        .collect();
    if !links.is_empty() {
        out.push_str("\n**Sources**\n\n");
        for link in links {
            out.push_str(&link);
            out.push('\n');
        }
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support;
    use crate::store::{write_json, write_jsonl};
    use marketbrief_shared::TopicItem;
    use serde_json::json;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 17).unwrap()
    }

    fn topic(id: &str, title: &str, count: usize) -> TopicCluster {
        let items = vec![
            TopicItem {
                title: format!("{title} headline"),
                source: Some("Wire".into()),
                url: Some(format!("https://news.example.com/{id}")),
                snippet: None,
            },
            TopicItem {
                title: "No link".into(),
                source: None,
                url: None,
                snippet: None,
            },
        ];
        TopicCluster::new(id.into(), title.into(), format!("{title} representative"), count, items)
    }

    fn row(id: &str) -> ResearchRow {
        ResearchRow {
            topic_id: id.into(),
            topic_title: "Fed".into(),
            summary: "Fed held rates.".into(),
            market_impact: "Yields eased.".into(),
            sentiment: 6,
            watch_symbols: vec!["TLT".into(), "SPY".into()],
            recommendation: None,
            source_count: 3,
            sources: vec![],
        }
    }

    #[test]
    fn renders_topics_research_and_metrics() {
        let metrics = json!({"BTC": 67000.5, "note": "a|b", "nested": {"x": 1}, "open": true});
        let md = render(
            date(),
            &[topic("t1", "Fed", 3), topic("t2", "Oil", 1)],
            &[row("t1")],
            Some(&metrics),
        );

        assert!(md.starts_with("# Market Brief: 2026-10-17\n"));
        assert!(md.contains("| BTC | 67000.5 |"));
        assert!(md.contains("| note | a\\|b |"));
        assert!(md.contains("| open | true |"));
        assert!(!md.contains("nested"));

        assert!(md.contains("### 1. Fed"));
        assert!(md.contains("_3 articles_"));
        assert!(md.contains("Fed held rates."));
        assert!(md.contains("- **Sentiment:** 6/10"));
        assert!(md.contains("- **Watch:** TLT, SPY"));
        assert!(!md.contains("Recommendation"));
        assert!(md.contains("- [Fed headline](https://news.example.com/t1) (Wire)"));
        assert!(!md.contains("No link"));

        assert!(md.contains("### 2. Oil"));
        assert!(md.contains("_1 article_"));
        assert!(md.contains("Oil representative"));
    }

    #[test]
    fn placeholder_research_falls_back_to_representative_text() {
        let mut placeholder = row("t1");
        placeholder.summary = "N/A".into();
        let md = render(date(), &[topic("t1", "Fed", 2)], &[placeholder], None);
        assert!(md.contains("_No metrics available._"));
        assert!(md.contains("Fed representative"));
    }

    #[test]
    fn empty_day_renders_placeholders() {
        let md = render(date(), &[], &[], Some(&json!([1, 2])));
        assert!(md.contains("_No metrics available._"));
        assert!(md.contains("_No topics for this date._"));
    }

    #[test]
    fn stage_requires_topics_only() {
        let (root, ctx) = test_support::context("report");
        assert!(run(&ctx).is_err());

        write_json(&ctx.layout.topics(ctx.date), &vec![topic("2026-10-17-001", "Fed", 2)]).unwrap();
        let meta = run(&ctx).unwrap();
        assert_eq!(meta.path, ctx.layout.report(ctx.date));
        let md = std::fs::read_to_string(&meta.path).unwrap();
        assert!(md.contains("Fed representative"));

        write_jsonl(&ctx.layout.research(ctx.date), &[row("2026-10-17-001")]).unwrap();
        write_json(&ctx.layout.metrics(ctx.date), &json!({"SPX": 5800})).unwrap();
        let meta = run(&ctx).unwrap();
        let md = std::fs::read_to_string(&meta.path).unwrap();
        assert!(md.contains("Fed held rates."));
        assert!(md.contains("| SPX | 5800 |"));

        let _ = std::fs::remove_dir_all(&root);
    }
}
