//! Filesystem and run-metadata helpers.

use std::io::IsTerminal;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use chrono::DateTime;
use chrono::Local;
use colored::Colorize;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use tracing::warn;

use crate::constants::METADATA_FILE;
use crate::constants::REPORT_DATA_FILE;
use crate::params::ParamNode;
use crate::params::ParamTree;

/// The kind of run recorded in the metadata file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunType {
    /// An iterative hyperparameter optimization.
    HpOptimization,
    /// An enumerated grid search.
    GridSearch,
}

/// The contents of the metadata file written at run start.
#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    /// The kind of run.
    pub run_type: RunType,
    /// The wall-clock start time of the run.
    pub start_time: DateTime<Local>,
}

/// Writes the run metadata file into the results directory.
pub fn save_metadata(result_dir: &Path, run_type: RunType, start_time: DateTime<Local>) -> Result<()> {
    let path = result_dir.join(METADATA_FILE);
    let metadata = RunMetadata {
        run_type,
        start_time,
    };
    let json = serde_json::to_string_pretty(&metadata)?;
    std::fs::write(&path, json)
        .with_context(|| format!("failed to write `{path}`", path = path.display()))
}

/// Writes the submission hook statistics into the results directory.
pub fn save_report_data(
    result_dir: &Path,
    submission_hook_stats: &indexmap::IndexMap<String, Option<String>>,
) -> Result<()> {
    let path = result_dir.join(REPORT_DATA_FILE);
    let json = serde_json::to_string_pretty(&serde_json::json!({
        "version": 1,
        "submission_hook_stats": submission_hook_stats,
    }))?;
    std::fs::write(&path, json)
        .with_context(|| format!("failed to write `{path}`", path = path.display()))
}

/// Asks a yes/no question on the terminal.
///
/// Returns `default` when stdin is not a terminal or the answer is empty.
pub fn ask_yes_no(question: &str, default: bool) -> bool {
    if !std::io::stdin().is_terminal() {
        return default;
    }

    let suffix = if default { "[Y/n]" } else { "[y/N]" };
    print!("{} {suffix} ", question.red().bold());
    let _ = std::io::stdout().flush();

    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return default;
    }
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => true,
        "n" | "no" => false,
        _ => default,
    }
}

/// Ensures a directory exists and is empty.
///
/// When `defensive` is set and the directory already has contents, the user
/// is asked for confirmation before anything is deleted; declining keeps the
/// directory untouched.
pub fn ensure_empty_dir(dir: &Path, defensive: bool) -> Result<()> {
    if dir.exists() {
        let confirmed = !defensive
            || ask_yes_no(
                &format!(
                    "Directory {dir} exists. Delete everything?",
                    dir = dir.display()
                ),
                false,
            );
        if confirmed {
            std::fs::remove_dir_all(dir).ok();
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create `{dir}`", dir = dir.display()))?;
            info!("deleted old contents of {dir}", dir = dir.display());
        }
    } else {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create `{dir}`", dir = dir.display()))?;
        info!("directory {dir} created", dir = dir.display());
    }
    Ok(())
}

/// Removes a directory tree, retrying once.
///
/// Network filesystems are sometimes slow to release entries, so a failed
/// removal is retried after a short pause. Failure to remove is logged, not
/// fatal.
pub async fn rm_dir_full(dir: &Path) {
    if !dir.exists() {
        return;
    }
    if std::fs::remove_dir_all(dir).is_err() {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if std::fs::remove_dir_all(dir).is_err() && dir.exists() {
            warn!("removing directory {dir} failed", dir = dir.display());
        }
    }
}

/// Derives a working directory name from a parameter setting.
///
/// Short settings yield a readable `<id>_<key>=<value>_...` name; anything
/// longer falls back to the plain job id.
pub fn dict_to_dirname(setting: &ParamTree, job_id: usize, smart_naming: bool) -> String {
    let parts: Vec<String> = setting
        .iter()
        .filter_map(|(key, node)| match node {
            ParamNode::Leaf(value) => {
                let key: String = key.chars().take(3).collect();
                let value: String = value.to_string().chars().take(6).collect();
                Some(format!("{key}={value}"))
            }
            ParamNode::Tree(_) => None,
        })
        .collect();
    let name = format!("{job_id}_{parts}", parts = parts.join("_"));
    if name.len() < 35 && smart_naming {
        return name;
    }
    job_id.to_string()
}

/// Gets a timestamp string usable in directory names.
pub fn get_time_string() -> String {
    Local::now().format("%Y%m%d-%H%M%S").to_string()
}

/// Creates a uniquely named persistent directory under the user cache.
pub fn make_temporary_dir(prefix: &str) -> Result<PathBuf> {
    let cache = dirs::cache_dir().context("failed to determine user cache directory")?;
    std::fs::create_dir_all(&cache)
        .with_context(|| format!("failed to create `{cache}`", cache = cache.display()))?;
    let dir = tempfile::Builder::new()
        .prefix(&format!("{prefix}-"))
        .tempdir_in(&cache)
        .context("failed to create temporary directory")?;
    Ok(dir.keep())
}
