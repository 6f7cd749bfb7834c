//! Date-keyed artifact layout and atomic file writes.
//!
//! Every artifact is written to a hidden temp file in the target directory and
//! renamed into place, so readers see either the previous file or the complete
//! new one.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

use marketbrief_shared::{MarketBriefError, Result, date_key};

/// File name of the pipeline lock marker.
pub const LOCK_FILE_NAME: &str = "pipeline.lock";

// ---------------------------------------------------------------------------
// DataLayout
// ---------------------------------------------------------------------------

/// Paths of every artifact under the data root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Upstream feed items written by the ingest stage.
    pub fn raw(&self, date: NaiveDate) -> PathBuf {
        self.dated("raw", date, "jsonl")
    }

    /// Market metrics written by the metrics stage.
    pub fn metrics(&self, date: NaiveDate) -> PathBuf {
        self.dated("metrics", date, "json")
    }

    pub fn normalized(&self, date: NaiveDate) -> PathBuf {
        self.dated("normalized", date, "jsonl")
    }

    pub fn topics(&self, date: NaiveDate) -> PathBuf {
        self.dated("topics", date, "json")
    }

    pub fn research(&self, date: NaiveDate) -> PathBuf {
        self.dated("research", date, "jsonl")
    }

    pub fn report(&self, date: NaiveDate) -> PathBuf {
        self.dated("reports", date, "md")
    }

    pub fn run_log(&self, date: NaiveDate) -> PathBuf {
        self.dated("logs", date, "run.log")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE_NAME)
    }

    fn dated(&self, dir: &str, date: NaiveDate, ext: &str) -> PathBuf {
        self.root.join(dir).join(format!("{}.{ext}", date_key(date)))
    }
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Checksum and size of a written artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactMeta {
    pub path: PathBuf,
    pub sha256: String,
    pub size_bytes: usize,
}

/// Write `content` to `path` via temp file + rename.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<ArtifactMeta> {
    let dir = path
        .parent()
        .ok_or_else(|| MarketBriefError::validation(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(dir).map_err(|e| MarketBriefError::io(dir, e))?;

    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MarketBriefError::validation(format!("{} has no file name", path.display())))?;
    let temp = dir.join(format!(".{filename}.tmp"));

    std::fs::write(&temp, content).map_err(|e| MarketBriefError::io(&temp, e))?;
    if let Err(e) = std::fs::rename(&temp, path) {
        let _ = std::fs::remove_file(&temp);
        return Err(MarketBriefError::io(path, e));
    }

    let mut hasher = Sha256::new();
    hasher.update(content);
    let sha256 = format!("{:x}", hasher.finalize());

    debug!(path = %path.display(), size = content.len(), "wrote artifact");

    Ok(ArtifactMeta {
        path: path.to_path_buf(),
        sha256,
        size_bytes: content.len(),
    })
}

/// Write a pretty-printed JSON document.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, data: &T) -> Result<ArtifactMeta> {
    let mut json = serde_json::to_string_pretty(data)
        .map_err(|e| MarketBriefError::validation(format!("JSON serialization failed: {e}")))?;
    json.push('\n');
    write_atomic(path, json.as_bytes())
}

/// Write one JSON object per line.
pub fn write_jsonl<T: Serialize>(path: &Path, rows: &[T]) -> Result<ArtifactMeta> {
    let mut out = String::new();
    for row in rows {
        let line = serde_json::to_string(row)
            .map_err(|e| MarketBriefError::validation(format!("JSON serialization failed: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    write_atomic(path, out.as_bytes())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// Read a JSON document.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| MarketBriefError::io(path, e))?;
    serde_json::from_str(&content)
        .map_err(|e| MarketBriefError::parse(format!("{}: {e}", path.display())))
}

/// Read a JSON document, or `None` if the file does not exist.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

/// Read a JSON-lines file, skipping blank lines. Missing file yields `None`.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Option<Vec<T>>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| MarketBriefError::io(path, e))?;
    let mut rows = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row = serde_json::from_str(line).map_err(|e| {
            MarketBriefError::parse(format!("{}:{}: {e}", path.display(), n + 1))
        })?;
        rows.push(row);
    }
    Ok(Some(rows))
}
