//! Shared types, error model, and configuration for MarketBrief.
//!
//! This crate is the foundation depended on by all other MarketBrief crates.
//! It provides:
//! - [`MarketBriefError`] — the unified error type
//! - Domain types ([`NormalizedEntry`], [`TopicCluster`], [`ResearchRow`], [`StageName`])
//! - Configuration ([`AppConfig`], [`ClusterConfig`], config loading)
//! - Run-date helpers

pub mod config;
pub mod date;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClusterConfig, ClusteringConfig, EnrichConfig, InferenceConfig, OutputConfig,
    PipelineConfig, RetryConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, parse_utc_offset,
};
pub use date::{DATE_FORMAT, date_key, resolve_date, today_in};
pub use error::{MarketBriefError, Result};
pub use types::{NormalizedEntry, ResearchRow, StageName, TopicCluster, TopicItem, topic_id};
