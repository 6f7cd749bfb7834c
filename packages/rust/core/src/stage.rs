//! Runs one pipeline stage as a child process.

use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, instrument, warn};

use marketbrief_shared::{StageName, date_key};

use crate::run_log::{RunEvent, RunLog};

/// The command line for a stage, without the trailing `--date`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageInvocation {
    pub stage: StageName,
    pub program: String,
    pub args: Vec<String>,
}

impl StageInvocation {
    /// Build from `[program, args..]`; `None` if the slice is empty.
    pub fn from_argv(stage: StageName, argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            stage,
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    /// `<exe> [--config <path>] stage <name>`.
    pub fn builtin(stage: StageName, exe: &str, config_path: Option<&str>) -> Self {
        let mut args = Vec::new();
        if let Some(path) = config_path {
            args.push("--config".to_string());
            args.push(path.to_string());
        }
        args.push("stage".to_string());
        args.push(stage.as_str().to_string());
        Self {
            stage,
            program: exe.to_string(),
            args,
        }
    }

    /// Full argv including `--date`.
    pub fn command_line(&self, date: NaiveDate) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 3);
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv.push("--date".to_string());
        argv.push(date_key(date));
        argv
    }
}

/// How the child ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageExit {
    /// `None` when the process never started or was killed by a signal.
    pub code: Option<i32>,
    pub error: Option<String>,
}

/// Outcome of one stage execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub stage: StageName,
    pub ok: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub exit: StageExit,
}

/// Spawns stage children and forwards their output to the run log.
#[derive(Debug)]
pub struct StageRunner<'a> {
    log: &'a RunLog,
}

impl<'a> StageRunner<'a> {
    pub fn new(log: &'a RunLog) -> Self {
        Self { log }
    }

    /// Run `invocation` for `date`. Never retries; failures are returned, not raised.
    #[instrument(skip_all, fields(stage = %invocation.stage, date = %date))]
    pub async fn run(&self, invocation: &StageInvocation, date: NaiveDate) -> StageResult {
        let stage = invocation.stage;
        let argv = invocation.command_line(date);
        let started_at = Utc::now();
        let start = Instant::now();

        self.log.record(&RunEvent::StageStarted {
            stage: stage.to_string(),
            command: argv.clone(),
        });
        info!(command = ?argv, "stage started");

        let exit = self.execute(stage, &argv).await;
        let ok = exit.error.is_none();
        let duration = start.elapsed();

        self.log.record(&RunEvent::StageFinished {
            stage: stage.to_string(),
            ok,
            duration_ms: duration.as_millis() as u64,
            exit_code: exit.code,
            error: exit.error.clone(),
        });
        if ok {
            info!(duration_ms = duration.as_millis() as u64, "stage finished");
        } else {
            warn!(
                duration_ms = duration.as_millis() as u64,
                exit_code = ?exit.code,
                error = exit.error.as_deref().unwrap_or_default(),
                "stage failed"
            );
        }

        StageResult {
            stage,
            ok,
            started_at,
            finished_at: Utc::now(),
            duration,
            exit,
        }
    }

    async fn execute(&self, stage: StageName, argv: &[String]) -> StageExit {
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return StageExit {
                    code: None,
                    error: Some(format!("failed to spawn `{}`: {e}", argv[0])),
                };
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (_, _, status) = tokio::join!(
            self.forward(stage, "stdout", stdout),
            self.forward(stage, "stderr", stderr),
            child.wait(),
        );

        match status {
            Ok(status) if status.success() => StageExit {
                code: status.code(),
                error: None,
            },
            Ok(status) => StageExit {
                code: status.code(),
                error: Some(format!("exited with {status}")),
            },
            Err(e) => StageExit {
                code: None,
                error: Some(format!("failed to wait for child: {e}")),
            },
        }
    }

    /// Copy each line of a child stream to tracing and the run log.
    ///
    /// Invalid UTF-8 is replaced, and the pipe is drained to EOF even after a
    /// read error so the child never blocks or hits a closed pipe.
    async fn forward<R: AsyncRead + Unpin>(
        &self,
        stage: StageName,
        stream: &'static str,
        reader: Option<R>,
    ) {
        let Some(reader) = reader else {
            return;
        };
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    info!(stage = %stage, stream, "{line}");
                    self.log.record(&RunEvent::StageOutput {
                        stage: stage.to_string(),
                        stream,
                        line,
                    });
                }
                Err(e) => {
                    warn!(stage = %stage, stream, error = %e, "failed to read stage output, discarding the rest");
                    if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
                        warn!(stage = %stage, stream, error = %e, "failed to drain stage output");
                    }
                    break;
                }
            }
        }
    }
}
