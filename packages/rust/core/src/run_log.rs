//! Per-date structured run log (`logs/<date>.run.log`, JSON lines).
//!
//! The orchestrator and every stage child process append to the same file.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use marketbrief_clustering::ClusterSummary;
use marketbrief_shared::{MarketBriefError, Result};

use crate::store::ArtifactMeta;

/// One run-log record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        date: String,
        stages: Vec<String>,
    },
    StageStarted {
        stage: String,
        command: Vec<String>,
    },
    StageOutput {
        stage: String,
        stream: &'static str,
        line: String,
    },
    StageFinished {
        stage: String,
        ok: bool,
        duration_ms: u64,
        exit_code: Option<i32>,
        error: Option<String>,
    },
    ClusterSummary(ClusterSummary),
    ArtifactWritten {
        path: PathBuf,
        sha256: String,
        size_bytes: usize,
    },
    RunFinished {
        run_id: String,
        status: &'static str,
        failed_stage: Option<String>,
        duration_ms: u64,
    },
    LockReleased {
        run_id: String,
    },
}

impl From<&ArtifactMeta> for RunEvent {
    fn from(meta: &ArtifactMeta) -> Self {
        RunEvent::ArtifactWritten {
            path: meta.path.clone(),
            sha256: meta.sha256.clone(),
            size_bytes: meta.size_bytes,
        }
    }
}

#[derive(Serialize)]
struct Record<'a> {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a RunEvent,
}

/// Append-only JSON-lines sink.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLog {
    /// Open (or create) the log in append mode.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| MarketBriefError::io(dir, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| MarketBriefError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a single line.
    pub fn append(&self, event: &RunEvent) -> Result<()> {
        let record = Record {
            ts: Utc::now(),
            event,
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|e| MarketBriefError::validation(format!("run log serialization failed: {e}")))?;
        line.push('\n');

        let mut file = self
            .file
            .lock()
            .map_err(|_| MarketBriefError::validation("run log mutex poisoned"))?;
        file.write_all(line.as_bytes())
            .map_err(|e| MarketBriefError::io(&self.path, e))
    }

    /// Append, downgrading failure to a warning.
    pub fn record(&self, event: &RunEvent) {
        if let Err(e) = self.append(event) {
            warn!(path = %self.path.display(), error = %e, "failed to write run log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log() -> PathBuf {
        std::env::temp_dir()
            .join(format!("mb-runlog-test-{}", uuid::Uuid::now_v7()))
            .join("logs")
            .join("2026-10-17.run.log")
    }

    #[test]
    fn events_are_tagged_json_lines() {
        let path = temp_log();
        let log = RunLog::open(&path).unwrap();
        log.append(&RunEvent::StageStarted {
            stage: "cluster".into(),
            command: vec!["marketbrief".into(), "stage".into(), "cluster".into()],
        })
        .unwrap();
        log.record(&RunEvent::LockReleased {
            run_id: "0190".into(),
        });

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "stage_started");
        assert_eq!(lines[0]["stage"], "cluster");
        assert!(lines[0]["ts"].is_string());
        assert_eq!(lines[1]["event"], "lock_released");

        let _ = std::fs::remove_dir_all(path.parent().unwrap().parent().unwrap());
    }

    #[test]
    fn reopening_appends() {
        let path = temp_log();
        RunLog::open(&path)
            .unwrap()
            .append(&RunEvent::LockReleased { run_id: "a".into() })
            .unwrap();
        RunLog::open(&path)
            .unwrap()
            .append(&RunEvent::LockReleased { run_id: "b".into() })
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        let _ = std::fs::remove_dir_all(path.parent().unwrap().parent().unwrap());
    }

    #[test]
    fn cluster_summary_fields_are_flattened() {
        let summary = ClusterSummary {
            degraded: true,
            entries: 5,
            duplicates: 0,
            embedded: 0,
            unembedded: vec!["a".into()],
            topics: 5,
            threshold: 0.82,
            relaxations: 0,
            singleton_merges: 0,
            forced_merges: 0,
            label_fallbacks: 0,
        };
        let event = RunEvent::ClusterSummary(summary);
        let json = serde_json::to_value(Record {
            ts: Utc::now(),
            event: &event,
        })
        .unwrap();
        assert_eq!(json["event"], "cluster_summary");
        assert_eq!(json["degraded"], true);
        assert_eq!(json["unembedded"][0], "a");
    }
}
