//! Built-in stage implementations, run through `marketbrief stage <name>`.
//!
//! Stages share nothing in memory; each reads and writes date-keyed files
//! under the data root and appends to the date's run log.

pub mod cluster;
pub mod enrich;
pub mod preprocess;
pub mod report;

use chrono::NaiveDate;
use tracing::info;

use marketbrief_shared::{AppConfig, MarketBriefError, Result, StageName};

use crate::run_log::{RunEvent, RunLog};
use crate::store::{ArtifactMeta, DataLayout};

/// Inputs shared by every built-in stage.
#[derive(Debug)]
pub struct StageContext {
    pub config: AppConfig,
    pub layout: DataLayout,
    pub date: NaiveDate,
    pub log: RunLog,
}

impl StageContext {
    pub fn new(config: AppConfig, date: NaiveDate) -> Result<Self> {
        let layout = DataLayout::new(config.base_dir());
        let log = RunLog::open(&layout.run_log(date))?;
        Ok(Self {
            config,
            layout,
            date,
            log,
        })
    }

    /// Log a freshly written artifact.
    pub fn artifact_written(&self, meta: &ArtifactMeta) {
        info!(
            path = %meta.path.display(),
            sha256 = %meta.sha256,
            size_bytes = meta.size_bytes,
            "artifact written"
        );
        self.log.record(&RunEvent::from(meta));
    }
}

/// Run one built-in stage.
pub async fn run_stage(stage: StageName, ctx: &StageContext) -> Result<()> {
    match stage {
        StageName::Preprocess => preprocess::run(ctx).map(|_| ()),
        StageName::Cluster => cluster::run(ctx).await.map(|_| ()),
        StageName::Enrich => enrich::run(ctx).await.map(|_| ()),
        StageName::Report => report::run(ctx).map(|_| ()),
        StageName::Metrics | StageName::Ingest => Err(MarketBriefError::config(format!(
            "stage `{stage}` has no built-in implementation; configure it under [pipeline.commands]"
        ))),
    }
}
