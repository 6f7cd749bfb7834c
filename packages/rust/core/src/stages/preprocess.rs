//! `preprocess`: raw feed items → cleaned [`NormalizedEntry`] lines.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use scraper::Html;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use marketbrief_shared::{NormalizedEntry, Result};

use crate::stages::StageContext;
use crate::store::{ArtifactMeta, read_jsonl, write_jsonl};

/// Naive timestamp layouts accepted besides RFC 3339 / RFC 2822.
const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Elements whose text is never content.
const SKIPPED_ELEMENTS: &[&str] = &["script", "style", "noscript"];

#[instrument(skip_all, fields(date = %ctx.date))]
pub fn run(ctx: &StageContext) -> Result<Option<ArtifactMeta>> {
    let raw_path = ctx.layout.raw(ctx.date);
    let raw: Vec<Value> = read_jsonl(&raw_path)?.unwrap_or_default();
    if raw.is_empty() {
        warn!(path = %raw_path.display(), "no raw items for date, nothing to preprocess");
        return Ok(None);
    }

    let offset = ctx.config.output.offset()?;
    let entries = normalize_items(&raw, offset);
    info!(raw = raw.len(), normalized = entries.len(), "preprocessed feed items");

    let meta = write_jsonl(&ctx.layout.normalized(ctx.date), &entries)?;
    ctx.artifact_written(&meta);
    Ok(Some(meta))
}

/// Clean and deduplicate raw items, preserving input order.
pub fn normalize_items(raw: &[Value], offset: FixedOffset) -> Vec<NormalizedEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(raw.len());

    for item in raw {
        let title = strip_html(first_str(item, &["title"]).unwrap_or_default());
        if title.is_empty() {
            continue;
        }
        let url = first_str(item, &["url", "link"])
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let item_id = item_id(item, &title, url.as_deref());

        if !seen.insert((item_id.clone(), title.clone(), url.clone())) {
            continue;
        }

        let clean_text = first_str(item, &["content", "summary"])
            .map(strip_html)
            .unwrap_or_default();
        let source = item
            .get("feed")
            .and_then(|feed| feed.get("title"))
            .and_then(Value::as_str)
            .or_else(|| first_str(item, &["feed_title"]))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let published_at = ["published_at", "date", "created_at"]
            .iter()
            .filter_map(|key| item.get(*key))
            .find_map(|value| parse_timestamp(value, offset));

        entries.push(NormalizedEntry {
            item_id,
            title,
            clean_text,
            source,
            published_at,
            url,
        });
    }
    entries
}

/// Strip markup, decode entities and collapse whitespace.
pub fn strip_html(input: &str) -> String {
    static WS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

    let text = if input.contains('<') || input.contains('&') {
        let fragment = Html::parse_fragment(input);
        fragment
            .root_element()
            .descendants()
            .filter_map(|node| {
                let text = node.value().as_text()?;
                let skipped = node
                    .parent()
                    .and_then(|p| p.value().as_element().map(|e| e.name().to_string()))
                    .is_some_and(|name| SKIPPED_ELEMENTS.contains(&name.as_str()));
                let text: &str = text;
                (!skipped).then(|| text.to_string())
            })
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        input.to_string()
    };

    WS_RE.replace_all(&text, " ").trim().to_string()
}

/// Parse a timestamp into `offset`. Naive times are taken as UTC.
pub fn parse_timestamp(value: &Value, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    let utc = match value {
        Value::String(s) => parse_timestamp_str(s.trim())?,
        Value::Number(n) => {
            let secs = n.as_f64()?;
            // Millisecond epochs are larger than any plausible second epoch.
            let secs = if secs > 1e12 { secs / 1000.0 } else { secs };
            Utc.timestamp_opt(secs as i64, 0).single()?
        }
        _ => return None,
    };
    Some(utc.with_timezone(&offset))
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn first_str<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| item.get(*key).and_then(Value::as_str))
        .find(|s| !s.trim().is_empty())
}

/// Upstream id as a string, or a stable hash when absent.
fn item_id(item: &Value, title: &str, url: Option<&str>) -> String {
    match item.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            let mut hasher = Sha256::new();
            hasher.update(title.as_bytes());
            hasher.update(b"\n");
            hasher.update(url.unwrap_or_default().as_bytes());
            format!("{:x}", hasher.finalize())[..16].to_string()
        }
    }
}
