//! Command line tool for orchestrating hyperparameter experiments on batch
//! clusters.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;

pub mod commands;
mod logging;

/// The command line interface of sweepmill.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Command,

    /// The verbosity of console output.
    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

/// The subcommands of sweepmill.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run every combination of the configured hyperparameter values.
    GridSearch(commands::grid_search::GridSearchArgs),
    /// Iteratively optimize hyperparameters with an optimizer.
    HpOptimization(commands::hp_optimization::HpOptimizationArgs),
}

/// The entry point of the sweepmill binary.
///
/// Exits with code 0 on clean completion and 1 when the run was
/// interrupted or aborted.
pub async fn sweepmill_main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::GridSearch(args) => commands::grid_search::grid_search(args, &cli.verbosity).await,
        Command::HpOptimization(args) => {
            commands::hp_optimization::hp_optimization(args, &cli.verbosity).await
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
