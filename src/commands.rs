//! Implementation of sweepmill CLI commands.

pub mod grid_search;
pub mod hp_optimization;

use std::path::Path;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use sweepmill_engine::Paths;
use sweepmill_engine::Settings;
use sweepmill_engine::utils::ensure_empty_dir;

/// Arguments shared by both run commands.
#[derive(Parser, Debug)]
pub struct CommonArgs {
    /// Path to the settings file (JSON, YAML, or TOML).
    #[arg(required = true, value_name = "SETTINGS_FILE")]
    pub settings_file: PathBuf,

    /// Additional settings in the format `<key>=<value>`.
    ///
    /// These overwrite settings from the settings file; keys address nested
    /// options with dots, e.g. `optimization_setting.minimize=true`.
    #[arg(value_name = "KEY=VALUE")]
    pub overrides: Vec<String>,

    /// Never prompt on the terminal; assume safe defaults.
    #[arg(long)]
    pub no_user_interaction: bool,

    /// Run on the local machine even when no cluster is detected.
    #[arg(long)]
    pub run_local: bool,
}

/// Loads the settings and prepares the run directories.
///
/// An existing results directory is only emptied after interactive
/// confirmation; without interaction its contents are kept, which is what
/// resuming runs rely on.
pub(crate) fn prepare_run(args: &CommonArgs) -> Result<(Settings, Paths)> {
    let mut settings = Settings::load(&args.settings_file, &args.overrides)?;
    if args.no_user_interaction {
        settings.no_user_interaction = true;
    }
    if args.run_local {
        settings.run_local = Some(true);
    }

    let paths = Paths::from_settings(&settings)?;
    if settings.no_user_interaction {
        std::fs::create_dir_all(&paths.result_dir)?;
    } else {
        ensure_empty_dir(&paths.result_dir, true)?;
    }

    Ok((settings, paths))
}

/// Formats a results directory path for final messages.
pub(crate) fn display_dir(path: &Path) -> String {
    path.display().to_string()
}
