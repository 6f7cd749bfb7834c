//! MarketBrief CLI: daily news to market report pipeline.
//!
//! `marketbrief run` executes every stage for a date under the pipeline
//! lock; `marketbrief stage <name>` is what each built-in stage child runs.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
