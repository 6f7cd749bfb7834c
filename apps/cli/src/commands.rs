//! CLI command definitions, routing, and tracing setup.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use marketbrief_core::{
    DataLayout, LockManager, LockStatus, Orchestrator, ProgressReporter, RunReport, RunState,
    StageContext, StageResult, Unlock, run_stage,
};
use marketbrief_shared::{
    AppConfig, StageName, config_file_path, date_key, init_config, load_config, load_config_from,
    resolve_date,
};
use tracing::{error, info};

/// Exit code when a stage fails.
const EXIT_STAGE_FAILED: u8 = 1;
/// Exit code when another run holds the lock.
const EXIT_LOCK_HELD: u8 = 2;
/// Exit code after Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// MarketBrief: turn the day's news into a market report.
#[derive(Parser)]
#[command(
    name = "marketbrief",
    version,
    about = "Run the daily news to market report pipeline.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.marketbrief/marketbrief.toml).
    #[arg(long, global = true, env = "MARKETBRIEF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run every stage for a date under the pipeline lock.
    Run {
        /// Run date, YYYY-MM-DD (defaults to today in output.utc_offset).
        #[arg(long)]
        date: Option<String>,

        /// Clear the pipeline lock first if it is stale.
        #[arg(long)]
        force_unlock: bool,
    },

    /// Run one built-in stage directly.
    Stage {
        /// preprocess, cluster, enrich or report.
        name: StageName,

        /// Run date, YYYY-MM-DD (defaults to today in output.utc_offset).
        #[arg(long)]
        date: Option<String>,
    },

    /// Remove a stale pipeline lock.
    Unlock {
        /// Remove the lock even if it is not stale.
        #[arg(long)]
        force: bool,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. `RUST_LOG` takes precedence.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "marketbrief=info",
        1 => "marketbrief=debug",
        _ => "marketbrief=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(std::io::stderr().is_terminal())
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run { date, force_unlock } => {
            cmd_run(config_path, date.as_deref(), force_unlock).await
        }
        Command::Stage { name, date } => cmd_stage(config_path, name, date.as_deref()).await,
        Command::Unlock { force } => cmd_unlock(config_path, force),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

/// Load and validate config from `--config`, or the default location.
fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let config = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    config.validate()?;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, date: Option<&str>, force_unlock: bool) -> Result<ExitCode> {
    let config = load(config_path)?;
    let date = resolve_date(date, config.output.offset()?)?;
    let exe = std::env::current_exe()
        .map_err(|e| eyre!("cannot locate the marketbrief executable: {e}"))?;
    let orchestrator = Orchestrator::from_config(&config, &exe, config_path)?;

    info!(date = %date_key(date), force_unlock, "starting pipeline run");
    let progress = CliProgress::new(orchestrator.invocations().len());

    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let outcome = orchestrator.run_until(date, force_unlock, &progress, ctrl_c).await;

    let report = match outcome {
        Ok(report) => report,
        Err(e) if e.is_lock_conflict() => {
            eprintln!("{e}");
            eprintln!("Another run is in progress. Use --force-unlock or `marketbrief unlock` if it is stale.");
            return Ok(ExitCode::from(EXIT_LOCK_HELD));
        }
        Err(e) => return Err(e.into()),
    };

    print_report(&report, orchestrator.layout());
    if report.succeeded() {
        Ok(ExitCode::SUCCESS)
    } else if report.interrupted() {
        Ok(ExitCode::from(EXIT_INTERRUPTED))
    } else {
        Ok(ExitCode::from(EXIT_STAGE_FAILED))
    }
}

fn print_report(report: &RunReport, layout: &DataLayout) {
    println!();
    match report.state {
        RunState::Completed => {
            println!("  Pipeline completed.");
            println!("  Report: {}", layout.report(report.date).display());
        }
        RunState::Interrupted(_) => {
            println!("  Pipeline interrupted; running stage killed and lock released.");
        }
        _ => {
            println!("  Pipeline failed.");
            if let Some(code) = report.failed_stage().and_then(|failed| failed.exit.code) {
                println!("  Exit:   {code}");
            }
            if let Some(err) = report.failure() {
                println!("  Error:  {err}");
            }
        }
    }
    println!("  Run:    {}", report.run_id);
    println!("  Date:   {}", date_key(report.date));
    println!("  Log:    {}", layout.run_log(report.date).display());
    println!("  Time:   {:.1}s", report.duration.as_secs_f64());
    println!();
}

async fn cmd_stage(config_path: Option<&Path>, stage: StageName, date: Option<&str>) -> Result<ExitCode> {
    let config = load(config_path)?;
    let date = resolve_date(date, config.output.offset()?)?;
    let ctx = StageContext::new(config, date)?;

    match run_stage(stage, &ctx).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(e) => {
            error!(stage = %stage, error = %e, "stage failed");
            Ok(ExitCode::from(EXIT_STAGE_FAILED))
        }
    }
}

fn cmd_unlock(config_path: Option<&Path>, force: bool) -> Result<ExitCode> {
    let config = load(config_path)?;
    let layout = DataLayout::new(config.base_dir());
    let lock = LockManager::new(
        layout.lock_file(),
        Duration::from_secs(config.pipeline.stale_lock_secs),
    );

    let outcome = if force { lock.force_clear()? } else { lock.clear_stale()? };
    match outcome {
        Unlock::NotLocked => {
            println!("No pipeline lock at {}", lock.path().display());
            Ok(ExitCode::SUCCESS)
        }
        Unlock::Removed(status) => {
            println!("Removed lock held by {}", holder(&status));
            Ok(ExitCode::SUCCESS)
        }
        Unlock::Kept(status) => {
            println!(
                "Lock held by {} is {}s old and not stale; use --force to remove it.",
                holder(&status),
                status.age.as_secs()
            );
            Ok(ExitCode::from(EXIT_LOCK_HELD))
        }
    }
}

fn holder(status: &LockStatus) -> String {
    status
        .record
        .as_ref()
        .map_or_else(|| "an unknown run".to_string(), ToString::to_string)
}

fn cmd_config_init(config_path: Option<&Path>) -> Result<ExitCode> {
    let path = match config_path {
        Some(path) => {
            if path.exists() {
                return Err(eyre!("{} already exists", path.display()));
            }
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, toml::to_string_pretty(&AppConfig::default())?)?;
            path.to_path_buf()
        }
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(ExitCode::SUCCESS)
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<ExitCode> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };
    let config = load(config_path)?;
    println!("# {}", path.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(ExitCode::SUCCESS)
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif bar, one step per stage.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        let style = ProgressStyle::with_template("{spinner:.cyan} [{pos}/{len}] {msg} ({elapsed})")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✔"]);
        bar.set_style(style);
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar }
    }
}

impl ProgressReporter for CliProgress {
    fn stage_started(&self, stage: StageName, index: usize, _total: usize) {
        self.bar.set_position(index as u64);
        self.bar.set_message(format!("Running {stage}"));
    }

    fn stage_finished(&self, result: &StageResult) {
        if result.ok {
            self.bar.inc(1);
        } else {
            self.bar.set_message(format!("{} failed", result.stage));
        }
    }

    fn done(&self, report: &RunReport) {
        if report.succeeded() {
            self.bar.finish_and_clear();
        } else if report.interrupted() {
            self.bar.abandon_with_message("interrupted");
        } else {
            self.bar.abandon();
        }
    }
}
