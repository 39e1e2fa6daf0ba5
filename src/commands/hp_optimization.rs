//! Implementation of the `hp-optimization` command.

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use sweepmill_engine::RunOutcome;

use super::CommonArgs;
use super::prepare_run;
use crate::logging;

/// Arguments for the `hp-optimization` command.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct HpOptimizationArgs {
    /// The shared run arguments.
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Iteratively samples hyperparameter configurations with an optimizer.
pub async fn hp_optimization(
    args: HpOptimizationArgs,
    verbosity: &Verbosity<InfoLevel>,
) -> Result<ExitCode> {
    let (settings, paths) = prepare_run(&args.common)?;
    logging::init(&paths.result_dir, verbosity)?;

    match sweepmill_engine::hp_optimization(&settings, paths, Vec::new()).await? {
        RunOutcome::Completed => Ok(ExitCode::SUCCESS),
        RunOutcome::Interrupted => Ok(ExitCode::FAILURE),
    }
}
