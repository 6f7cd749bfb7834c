//! The daily pipeline: lock → stages in order → release.
//!
//! Stages run strictly one after another. The first failure halts the run;
//! artifacts written by earlier stages are left as they are. The lock is
//! released on every exit path, including panics, through [`LockGuard`].

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use marketbrief_shared::{AppConfig, MarketBriefError, Result, StageName, date_key};

use crate::lock::{LockGuard, LockManager, Unlock};
use crate::run_log::{RunEvent, RunLog};
use crate::stage::{StageInvocation, StageResult, StageRunner};
use crate::store::DataLayout;

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Position of a run in the stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initial,
    /// Stage at this index is executing.
    Running(usize),
    Completed,
    /// Stage at this index failed; later stages never started.
    Failed(usize),
    /// Shutdown was requested while the stage at this index was running.
    Interrupted(usize),
}

/// In-memory record of one orchestrator invocation.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: String,
    pub date: NaiveDate,
    pub stage_sequence: Vec<StageName>,
    pub current_stage: Option<StageName>,
    pub started_at: DateTime<Utc>,
}

/// Everything a run needs while it holds the lock.
struct RunContext<'a> {
    run: PipelineRun,
    lock: LockGuard,
    log: &'a RunLog,
}

/// Final report of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub date: NaiveDate,
    pub state: RunState,
    pub stages: Vec<StageResult>,
    pub duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn interrupted(&self) -> bool {
        matches!(self.state, RunState::Interrupted(_))
    }

    /// The stage that halted the run, if any.
    pub fn failed_stage(&self) -> Option<&StageResult> {
        match self.state {
            RunState::Failed(i) => self.stages.get(i),
            _ => None,
        }
    }

    /// The failing stage as an error value.
    pub fn failure(&self) -> Option<MarketBriefError> {
        let result = self.failed_stage()?;
        Some(MarketBriefError::StageFailed {
            stage: result.stage.to_string(),
            detail: result
                .exit
                .error
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called before stage `index` (0-based) of `total` starts.
    fn stage_started(&self, stage: StageName, index: usize, total: usize);
    /// Called after each stage with its result.
    fn stage_finished(&self, result: &StageResult);
    /// Called once the run reaches a terminal state.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn stage_started(&self, _stage: StageName, _index: usize, _total: usize) {}
    fn stage_finished(&self, _result: &StageResult) {}
    fn done(&self, _report: &RunReport) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Executes the fixed stage sequence for a date.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    layout: DataLayout,
    invocations: Vec<StageInvocation>,
    lock: LockManager,
}

impl Orchestrator {
    /// Build from explicit invocations, which must cover [`StageName::SEQUENCE`] in order.
    pub fn new(layout: DataLayout, invocations: Vec<StageInvocation>, lock: LockManager) -> Result<Self> {
        let stages: Vec<StageName> = invocations.iter().map(|i| i.stage).collect();
        if stages != StageName::SEQUENCE {
            return Err(MarketBriefError::config(format!(
                "stage invocations must cover {:?} in order, got {:?}",
                StageName::SEQUENCE,
                stages
            )));
        }
        Ok(Self {
            layout,
            invocations,
            lock,
        })
    }

    /// Resolve every stage's command from config.
    ///
    /// Built-in stages default to `<exe> [--config <path>] stage <name>`;
    /// `metrics` and `ingest` must be configured under `[pipeline.commands]`.
    pub fn from_config(config: &AppConfig, exe: &Path, config_path: Option<&Path>) -> Result<Self> {
        let exe = exe.to_string_lossy();
        let config_path = config_path.map(|p| p.to_string_lossy().into_owned());

        let mut invocations = Vec::with_capacity(StageName::SEQUENCE.len());
        let mut missing = Vec::new();
        for stage in StageName::SEQUENCE {
            let configured = config
                .pipeline
                .command_for(stage)
                .and_then(|argv| StageInvocation::from_argv(stage, argv));
            match configured {
                Some(invocation) => invocations.push(invocation),
                None if stage.is_builtin() => {
                    invocations.push(StageInvocation::builtin(stage, &exe, config_path.as_deref()));
                }
                None => missing.push(stage.as_str()),
            }
        }
        if !missing.is_empty() {
            return Err(MarketBriefError::config(format!(
                "no command configured for stage(s) {}; set them under [pipeline.commands]",
                missing.join(", ")
            )));
        }

        let layout = DataLayout::new(config.base_dir());
        let lock = LockManager::new(
            layout.lock_file(),
            Duration::from_secs(config.pipeline.stale_lock_secs),
        );
        Self::new(layout, invocations, lock)
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.lock
    }

    pub fn invocations(&self) -> &[StageInvocation] {
        &self.invocations
    }

    /// Run every stage for `date`.
    ///
    /// Returns `Err(LockHeld)` if another run holds the lock. Stage failures
    /// are reported through [`RunReport::state`], not as errors. With
    /// `force_unlock`, a stale lock is cleared first; a fresh one still conflicts.
    pub async fn run(
        &self,
        date: NaiveDate,
        force_unlock: bool,
        progress: &dyn ProgressReporter,
    ) -> Result<RunReport> {
        self.run_until(date, force_unlock, progress, std::future::pending::<()>())
            .await
    }

    /// Like [`run`](Self::run), but stops once `shutdown` resolves.
    ///
    /// The running stage's child is killed, the run finishes as
    /// [`RunState::Interrupted`] and the lock is released as usual.
    #[instrument(skip_all, fields(date = %date))]
    pub async fn run_until<F: Future<Output = ()>>(
        &self,
        date: NaiveDate,
        force_unlock: bool,
        progress: &dyn ProgressReporter,
        shutdown: F,
    ) -> Result<RunReport> {
        if force_unlock {
            match self.lock.clear_stale()? {
                Unlock::Kept(status) => {
                    warn!(age_secs = status.age.as_secs(), "lock is not stale, not clearing it");
                }
                Unlock::Removed(_) | Unlock::NotLocked => {}
            }
        }

        let run_id = Uuid::now_v7().to_string();
        let guard = self.lock.acquire(&run_id, date)?;
        let log = RunLog::open(&self.layout.run_log(date))?;

        let mut ctx = RunContext {
            run: PipelineRun {
                run_id,
                date,
                stage_sequence: self.invocations.iter().map(|i| i.stage).collect(),
                current_stage: None,
                started_at: Utc::now(),
            },
            lock: guard,
            log: &log,
        };

        let report = self.execute(&mut ctx, progress, shutdown).await;

        match ctx.lock.release() {
            Ok(_) => log.record(&RunEvent::LockReleased {
                run_id: ctx.run.run_id.clone(),
            }),
            Err(e) => warn!(error = %e, "failed to release pipeline lock"),
        }

        progress.done(&report);
        Ok(report)
    }

    async fn execute<F: Future<Output = ()>>(
        &self,
        ctx: &mut RunContext<'_>,
        progress: &dyn ProgressReporter,
        shutdown: F,
    ) -> RunReport {
        let mut shutdown = std::pin::pin!(shutdown);
        let start = Instant::now();
        let total = self.invocations.len();
        ctx.log.record(&RunEvent::RunStarted {
            run_id: ctx.run.run_id.clone(),
            date: date_key(ctx.run.date),
            stages: ctx.run.stage_sequence.iter().map(|s| s.to_string()).collect(),
        });
        info!(run_id = %ctx.run.run_id, lock_holder = %ctx.lock.run_id(), stages = total, "pipeline run started");

        let runner = StageRunner::new(ctx.log);
        let mut stages = Vec::with_capacity(total);
        let mut state = RunState::Initial;

        for (index, invocation) in self.invocations.iter().enumerate() {
            state = RunState::Running(index);
            ctx.run.current_stage = Some(invocation.stage);
            progress.stage_started(invocation.stage, index, total);

            let stage_start = Instant::now();
            let finished = tokio::select! {
                result = runner.run(invocation, ctx.run.date) => Some(result),
                () = &mut shutdown => None,
            };
            let Some(result) = finished else {
                ctx.log.record(&RunEvent::StageFinished {
                    stage: invocation.stage.to_string(),
                    ok: false,
                    duration_ms: stage_start.elapsed().as_millis() as u64,
                    exit_code: None,
                    error: Some("interrupted".to_string()),
                });
                state = RunState::Interrupted(index);
                break;
            };
            progress.stage_finished(&result);
            let ok = result.ok;
            stages.push(result);

            if !ok {
                state = RunState::Failed(index);
                break;
            }
        }
        if let RunState::Running(_) | RunState::Initial = state {
            state = RunState::Completed;
        }
        ctx.run.current_stage = None;

        let duration = start.elapsed();
        let (status, failed_stage) = match state {
            RunState::Failed(i) => ("failed", Some(self.invocations[i].stage.to_string())),
            RunState::Interrupted(i) => ("interrupted", Some(self.invocations[i].stage.to_string())),
            _ => ("completed", None),
        };
        ctx.log.record(&RunEvent::RunFinished {
            run_id: ctx.run.run_id.clone(),
            status,
            failed_stage: failed_stage.clone(),
            duration_ms: duration.as_millis() as u64,
        });

        let report = RunReport {
            run_id: ctx.run.run_id.clone(),
            date: ctx.run.date,
            state,
            stages,
            duration,
        };
        let duration_ms = duration.as_millis() as u64;
        if let Some(err) = report.failure() {
            warn!(run_id = %report.run_id, error = %err, duration_ms, "pipeline run failed");
        } else if let Some(stage) = &failed_stage {
            warn!(run_id = %report.run_id, stage = %stage, duration_ms, "pipeline run interrupted");
        } else {
            info!(run_id = %report.run_id, duration_ms, "pipeline run completed");
        }
        report
    }
}
