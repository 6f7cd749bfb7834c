//! Pipeline orchestration and built-in stages for MarketBrief.
//!
//! The [`orchestrator`] runs the fixed stage sequence as child processes
//! under a filesystem lock; [`stages`] holds the in-process implementations
//! behind `marketbrief stage <name>`.

pub mod lock;
pub mod orchestrator;
pub mod run_log;
pub mod stage;
pub mod stages;
pub mod store;

pub use lock::{LockGuard, LockManager, LockRecord, LockStatus, Unlock};
pub use orchestrator::{Orchestrator, PipelineRun, ProgressReporter, RunReport, RunState, SilentProgress};
pub use run_log::{RunEvent, RunLog};
pub use stage::{StageInvocation, StageResult, StageRunner};
pub use stages::{StageContext, run_stage};
pub use store::{ArtifactMeta, DataLayout};
