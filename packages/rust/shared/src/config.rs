//! Application configuration for MarketBrief.
//!
//! User config lives at `~/.marketbrief/marketbrief.toml` unless `--config`
//! points elsewhere. Every field has a default, so a missing file or section
//! is never an error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{MarketBriefError, Result};
use crate::types::StageName;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "marketbrief.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".marketbrief";

// ---------------------------------------------------------------------------
// Config structs (matching marketbrief.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Data directory and date handling.
    #[serde(default)]
    pub output: OutputConfig,

    /// Embedding / chat endpoint settings.
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Topic clustering parameters.
    #[serde(default)]
    pub clustering: ClusteringConfig,

    /// Per-topic research parameters.
    #[serde(default)]
    pub enrich: EnrichConfig,

    /// Orchestrator settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Root of the date-keyed file store.
    #[serde(default = "default_base_dir")]
    pub base_dir: String,

    /// UTC offset used to resolve "today" and normalize timestamps, e.g. `+08:00`.
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            utc_offset: default_utc_offset(),
        }
    }
}

fn default_base_dir() -> String {
    "data".into()
}
fn default_utc_offset() -> String {
    "+00:00".into()
}

impl OutputConfig {
    /// Parse `utc_offset` into a chrono offset.
    pub fn offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.utc_offset)
    }
}

/// `[inference]` section: an OpenAI-compatible endpoint (e.g. a LiteLLM proxy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    /// Base URL; `/v1/embeddings` and `/v1/chat/completions` are appended.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_embed_model")]
    pub embed_model: String,

    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    #[serde(default = "default_embed_timeout")]
    pub embed_timeout_secs: u64,

    #[serde(default = "default_chat_timeout")]
    pub chat_timeout_secs: u64,

    /// Optional completion token cap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Upper bound on in-flight embedding/labeling requests.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Texts per embedding request.
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,

    /// Per-call retry budget.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            embed_model: default_embed_model(),
            chat_model: default_chat_model(),
            embed_timeout_secs: default_embed_timeout(),
            chat_timeout_secs: default_chat_timeout(),
            max_tokens: None,
            max_concurrency: default_max_concurrency(),
            embed_batch_size: default_embed_batch_size(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:9400".into()
}
fn default_api_key_env() -> String {
    "LITELLM_API_KEY".into()
}
fn default_embed_model() -> String {
    "text-embedding-3-small".into()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".into()
}
fn default_embed_timeout() -> u64 {
    30
}
fn default_chat_timeout() -> u64 {
    60
}
fn default_max_concurrency() -> usize {
    4
}
fn default_embed_batch_size() -> usize {
    32
}

impl InferenceConfig {
    /// Read the API key from the configured env var, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }
}

/// `[inference.retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on each further retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    500
}

/// `[clustering]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusteringConfig {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_threshold_min")]
    pub threshold_min: f32,
    #[serde(default = "default_threshold_max")]
    pub threshold_max: f32,
    /// How far the threshold drops per relaxation round.
    #[serde(default = "default_relax_step")]
    pub relax_step: f32,
    #[serde(default = "default_max_relaxations")]
    pub max_relaxations: u32,
    /// Singleton fallback merges at `threshold - merge_margin`.
    #[serde(default = "default_merge_margin")]
    pub merge_margin: f32,
    #[serde(default = "default_max_topics")]
    pub max_topics: usize,
    #[serde(default = "default_max_items_per_topic")]
    pub max_items_per_topic: usize,
    /// Member titles sent to the labeler.
    #[serde(default = "default_label_context_titles")]
    pub label_context_titles: usize,
    #[serde(default = "default_title_max_chars")]
    pub title_max_chars: usize,
    #[serde(default = "default_snippet_max_chars")]
    pub snippet_max_chars: usize,
    /// Characters of body text appended to the title for embedding.
    #[serde(default = "default_embed_text_chars")]
    pub embed_text_chars: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            threshold_min: default_threshold_min(),
            threshold_max: default_threshold_max(),
            relax_step: default_relax_step(),
            max_relaxations: default_max_relaxations(),
            merge_margin: default_merge_margin(),
            max_topics: default_max_topics(),
            max_items_per_topic: default_max_items_per_topic(),
            label_context_titles: default_label_context_titles(),
            title_max_chars: default_title_max_chars(),
            snippet_max_chars: default_snippet_max_chars(),
            embed_text_chars: default_embed_text_chars(),
        }
    }
}

fn default_similarity_threshold() -> f32 {
    0.82
}
fn default_threshold_min() -> f32 {
    0.60
}
fn default_threshold_max() -> f32 {
    0.90
}
fn default_relax_step() -> f32 {
    0.02
}
fn default_max_relaxations() -> u32 {
    6
}
fn default_merge_margin() -> f32 {
    0.05
}
fn default_max_topics() -> usize {
    40
}
fn default_max_items_per_topic() -> usize {
    15
}
fn default_label_context_titles() -> usize {
    5
}
fn default_title_max_chars() -> usize {
    60
}
fn default_snippet_max_chars() -> usize {
    300
}
fn default_embed_text_chars() -> usize {
    500
}

/// `[enrich]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichConfig {
    #[serde(default = "default_items_per_topic")]
    pub items_per_topic: usize,
    #[serde(default = "default_snippet_chars")]
    pub snippet_chars: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            items_per_topic: default_items_per_topic(),
            snippet_chars: default_snippet_chars(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_items_per_topic() -> usize {
    8
}
fn default_snippet_chars() -> usize {
    220
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Age after which a lock may be cleared with an explicit override.
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,

    /// Per-stage command overrides, keyed by stage name. `metrics` and
    /// `ingest` have no built-in implementation and must be listed here.
    #[serde(default)]
    pub commands: BTreeMap<String, Vec<String>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stale_lock_secs: default_stale_lock_secs(),
            commands: BTreeMap::new(),
        }
    }
}

fn default_stale_lock_secs() -> u64 {
    6 * 60 * 60
}

impl PipelineConfig {
    /// Configured command for a stage, if any.
    pub fn command_for(&self, stage: StageName) -> Option<&[String]> {
        self.commands
            .get(stage.as_str())
            .map(Vec::as_slice)
            .filter(|argv| !argv.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Cluster config (runtime, merged from [clustering] + [inference])
// ---------------------------------------------------------------------------

/// Runtime clustering configuration handed to the engine.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub similarity_threshold: f32,
    pub threshold_min: f32,
    pub threshold_max: f32,
    pub relax_step: f32,
    pub max_relaxations: u32,
    pub merge_margin: f32,
    pub max_topics: usize,
    pub max_items_per_topic: usize,
    pub label_context_titles: usize,
    pub title_max_chars: usize,
    pub snippet_max_chars: usize,
    pub embed_text_chars: usize,
    pub embed_batch_size: usize,
    pub max_concurrency: usize,
}

impl From<&AppConfig> for ClusterConfig {
    fn from(config: &AppConfig) -> Self {
        let c = &config.clustering;
        Self {
            similarity_threshold: c.similarity_threshold,
            threshold_min: c.threshold_min,
            threshold_max: c.threshold_max,
            relax_step: c.relax_step,
            max_relaxations: c.max_relaxations,
            merge_margin: c.merge_margin,
            max_topics: c.max_topics,
            max_items_per_topic: c.max_items_per_topic,
            label_context_titles: c.label_context_titles,
            title_max_chars: c.title_max_chars,
            snippet_max_chars: c.snippet_max_chars,
            embed_text_chars: c.embed_text_chars,
            embed_batch_size: config.inference.embed_batch_size,
            max_concurrency: config.inference.max_concurrency,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl ClusterConfig {
    /// Reject settings under which the clustering bounds cannot hold.
    pub fn validate(&self) -> Result<()> {
        if self.max_topics == 0 {
            return Err(MarketBriefError::config("clustering.max_topics must be at least 1"));
        }
        if self.max_items_per_topic == 0 {
            return Err(MarketBriefError::config(
                "clustering.max_items_per_topic must be at least 1",
            ));
        }
        if !self.similarity_threshold.is_finite() {
            return Err(MarketBriefError::config(format!(
                "clustering.similarity_threshold must be a finite number, got {}",
                self.similarity_threshold
            )));
        }
        if !(-1.0..=1.0).contains(&self.threshold_min)
            || !(-1.0..=1.0).contains(&self.threshold_max)
            || self.threshold_min > self.threshold_max
        {
            return Err(MarketBriefError::config(format!(
                "clustering thresholds must satisfy -1 <= threshold_min ({}) <= threshold_max ({}) <= 1",
                self.threshold_min, self.threshold_max
            )));
        }
        if !self.relax_step.is_finite() || self.relax_step <= 0.0 {
            return Err(MarketBriefError::config("clustering.relax_step must be positive"));
        }
        if !self.merge_margin.is_finite() || self.merge_margin < 0.0 {
            return Err(MarketBriefError::config("clustering.merge_margin must not be negative"));
        }
        if self.embed_batch_size == 0 || self.max_concurrency == 0 {
            return Err(MarketBriefError::config(
                "inference.embed_batch_size and inference.max_concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}

impl AppConfig {
    /// Validate cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        self.output.offset()?;
        Url::parse(&self.inference.base_url).map_err(|e| {
            MarketBriefError::config(format!(
                "inference.base_url '{}' is not a valid URL: {e}",
                self.inference.base_url
            ))
        })?;
        if self.inference.retry.max_attempts == 0 {
            return Err(MarketBriefError::config(
                "inference.retry.max_attempts must be at least 1",
            ));
        }
        if self.enrich.max_concurrency == 0 {
            return Err(MarketBriefError::config("enrich.max_concurrency must be at least 1"));
        }
        for key in self.pipeline.commands.keys() {
            key.parse::<StageName>().map_err(|e| {
                MarketBriefError::config(format!("[pipeline.commands]: {e}"))
            })?;
        }
        ClusterConfig::from(self).validate()
    }

    /// Absolute or cwd-relative data root.
    pub fn base_dir(&self) -> PathBuf {
        PathBuf::from(&self.output.base_dir)
    }
}

/// Parse `+HH:MM` / `-HH:MM` (or `Z`) into a fixed offset.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let invalid = || {
        MarketBriefError::config(format!(
            "invalid utc_offset '{raw}': expected +HH:MM or -HH:MM"
        ))
    };

    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(invalid);
    }

    let (sign, rest) = match raw.split_at_checked(1) {
        Some(("+", rest)) => (1, rest),
        Some(("-", rest)) => (-1, rest),
        _ => return Err(invalid()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(invalid)?;
    let hours: i32 = hours.parse().map_err(|_| invalid())?;
    let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return Err(invalid());
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.marketbrief/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| MarketBriefError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.marketbrief/marketbrief.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| MarketBriefError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        MarketBriefError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| MarketBriefError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| MarketBriefError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| MarketBriefError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("base_dir"));
        assert!(toml_str.contains("LITELLM_API_KEY"));
        assert!(toml_str.contains("similarity_threshold"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.clustering.max_topics, 40);
        assert_eq!(parsed.inference.retry.max_attempts, 3);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn config_with_stage_commands() {
        let toml_str = r#"
[output]
base_dir = "/srv/marketbrief"
utc_offset = "+08:00"

[clustering]
max_topics = 12

[pipeline.commands]
metrics = ["python3", "scripts/fetch_metrics.py"]
ingest = ["python3", "scripts/ingest_miniflux.py"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.clustering.max_topics, 12);
        assert_eq!(config.clustering.similarity_threshold, 0.82);
        assert_eq!(
            config.pipeline.command_for(StageName::Metrics).unwrap()[1],
            "scripts/fetch_metrics.py"
        );
        assert!(config.pipeline.command_for(StageName::Report).is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_stage_command_rejected() {
        let mut config = AppConfig::default();
        config
            .pipeline
            .commands
            .insert("deploy".into(), vec!["true".into()]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown stage 'deploy'"));
    }

    #[test]
    fn cluster_config_validation() {
        let mut cluster = ClusterConfig::default();
        assert!(cluster.validate().is_ok());

        cluster.max_topics = 0;
        assert!(cluster.validate().is_err());

        let mut cluster = ClusterConfig::default();
        cluster.threshold_min = 0.95;
        assert!(cluster.validate().is_err());

        let mut cluster = ClusterConfig::default();
        cluster.relax_step = 0.0;
        assert!(cluster.validate().is_err());
    }

    #[test]
    fn non_finite_cluster_values_rejected() {
        for bad in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let mut cluster = ClusterConfig::default();
            cluster.similarity_threshold = bad;
            let err = cluster.validate().unwrap_err();
            assert!(err.to_string().contains("similarity_threshold"), "{err}");

            let mut cluster = ClusterConfig::default();
            cluster.merge_margin = bad;
            assert!(cluster.validate().is_err());
        }

        let mut config = AppConfig::default();
        config.clustering.similarity_threshold = f32::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn utc_offset_parsing() {
        assert_eq!(parse_utc_offset("+08:00").unwrap().local_minus_utc(), 8 * 3600);
        assert_eq!(parse_utc_offset("-05:30").unwrap().local_minus_utc(), -(5 * 3600 + 1800));
        assert_eq!(parse_utc_offset("Z").unwrap().local_minus_utc(), 0);
        assert!(parse_utc_offset("Asia/Taipei").is_err());
        assert!(parse_utc_offset("+25:00").is_err());
    }
}
