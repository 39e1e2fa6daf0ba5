//! Implementation of the `grid-search` command.

use std::process::ExitCode;

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use sweepmill_engine::GridOutcome;
use sweepmill_engine::constants::FULL_DF_FILE;
use sweepmill_engine::settings::GenerateReport;
use sweepmill_engine::utils::save_report_data;
use tracing::warn;

use super::CommonArgs;
use super::display_dir;
use super::prepare_run;
use crate::logging;

/// Arguments for the `grid-search` command.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct GridSearchArgs {
    /// The shared run arguments.
    #[command(flatten)]
    pub common: CommonArgs,
}

/// Runs every combination of the configured hyperparameter values.
pub async fn grid_search(
    args: GridSearchArgs,
    verbosity: &Verbosity<InfoLevel>,
) -> Result<ExitCode> {
    let (settings, paths) = prepare_run(&args.common)?;
    logging::init(&paths.result_dir, verbosity)?;

    if settings.generate_report == GenerateReport::EveryIteration {
        warn!(
            "grid-search does not support generate_report='EVERY_ITERATION'; a report can only \
             be created when finished"
        );
    }

    let result_dir = paths.result_dir.clone();
    match sweepmill_engine::grid_search(&settings, paths, Vec::new()).await? {
        GridOutcome::Completed {
            results,
            hook_stats,
        } => {
            if results.is_empty() {
                bail!(
                    "no job results are available; either the jobs did not exit properly, or \
                     they never reported metrics"
                );
            }
            results.write_csv(&result_dir.join(FULL_DF_FILE))?;
            save_report_data(&result_dir, &hook_stats)?;
            println!("Results are stored in {}", display_dir(&result_dir));
            Ok(ExitCode::SUCCESS)
        }
        GridOutcome::Interrupted => Ok(ExitCode::FAILURE),
    }
}
