//! The optimizer contract consumed by the orchestrator.
//!
//! An optimizer proposes parameter settings (`ask`), receives the results of
//! completed jobs (`tell`), and persists its state between iterations. The
//! orchestrator only depends on this interface; concrete optimizers are
//! looked up in a small registry by their settings-file key.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use tracing::info;
use tracing::warn;

use crate::constants::FULL_DF_FILE;
use crate::constants::ITERATION;
use crate::constants::REDUCED_DF_FILE;
use crate::constants::STATUS_SNAPSHOT_FILE;
use crate::constants::WORKING_DIR;
use crate::error::EngineError;
use crate::job::Job;
use crate::params::ParamTree;
use crate::params::ParamValue;
use crate::results::Table;
use crate::settings::DistributionSpec;

mod cem;
mod grid;

pub use cem::CemMetaoptimizer;
pub use grid::GridSearchOptimizer;

/// An iterative optimizer over a parameter space.
pub trait Optimizer: Send + std::fmt::Debug {
    /// Proposes the next parameter setting.
    ///
    /// Returns `None` when the optimizer has exhausted its search space
    /// (only enumerating optimizers do).
    fn ask(&mut self) -> Option<ParamTree>;

    /// Feeds the results of completed jobs back into the optimizer.
    ///
    /// Every job is marked as used so it is told at most once; jobs without
    /// a result row are skipped.
    fn tell(&mut self, jobs: Vec<&mut Job>) -> Result<()>;

    /// The current iteration of the optimizer.
    fn iteration(&self) -> usize;

    /// Closes the current iteration.
    fn advance_iteration(&mut self);

    /// The table with one row per completed job.
    fn full_df(&self) -> &Table;

    /// The table aggregated over identical parameter choices.
    fn minimal_df(&self) -> &Table;

    /// The metric the optimizer ranks by, if it ranks at all.
    fn metric_to_optimize(&self) -> Option<&str>;

    /// Whether the metric is minimized.
    fn minimize(&self) -> bool;

    /// Persists the result tables and an optimizer snapshot.
    fn save_data_and_self(&self, directory: &Path) -> Result<()>;

    /// The working directories of the best completed jobs.
    fn best_jobs_working_dirs(&self, how_many: usize) -> Vec<PathBuf>;
}

/// The bookkeeping shared by all metric-driven optimizers.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct OptimizerData {
    /// The metric the optimizer ranks by.
    pub metric_to_optimize: String,
    /// Whether the metric is minimized.
    pub minimize: bool,
    /// The current iteration.
    pub iteration: usize,
    /// The flattened names of the optimized parameters.
    pub params: Vec<String>,
    /// One row per completed job, sorted by the metric.
    pub full_df: Table,
    /// Rows aggregated over identical parameter choices.
    pub minimal_df: Table,
}

impl OptimizerData {
    /// Constructs empty bookkeeping.
    pub fn new(metric_to_optimize: String, minimize: bool, params: Vec<String>) -> Self {
        Self {
            metric_to_optimize,
            minimize,
            iteration: 0,
            params,
            full_df: Table::new(),
            minimal_df: Table::new(),
        }
    }

    /// Appends the result rows of the given jobs and re-aggregates.
    ///
    /// Jobs are marked as used even when an error is raised afterwards, so a
    /// result is never fed into the optimizer twice.
    pub fn tell_rows(&mut self, jobs: Vec<&mut Job>) -> Result<()> {
        let mut iteration_df = Table::new();
        for job in jobs {
            job.results_used_for_update = true;

            let Some((row, _, _)) = job.results() else {
                continue;
            };
            if !row.contains_key(&self.metric_to_optimize) {
                return Err(EngineError::MissingMetric {
                    metric: self.metric_to_optimize.clone(),
                    job_id: job.id,
                }
                .into());
            }
            let mut row = row.clone();
            row.insert(
                ITERATION.to_string(),
                ParamValue::Int(self.iteration as i64 + 1),
            );
            iteration_df.push_row(row);
        }
        if iteration_df.is_empty() {
            return Ok(());
        }

        self.full_df.extend(iteration_df);
        self.full_df
            .sort_by_metric(&self.metric_to_optimize, self.minimize);
        self.minimal_df = self.full_df.average_out(
            &[self.metric_to_optimize.clone()],
            &self.params,
            self.minimize,
        )?;
        Ok(())
    }

    /// Writes `all_data.csv` and `reduced_data.csv` into the directory.
    pub fn save_tables(&self, directory: &Path) -> Result<()> {
        self.full_df.write_csv(&directory.join(FULL_DF_FILE))?;
        self.minimal_df.write_csv(&directory.join(REDUCED_DF_FILE))
    }

    /// The working directories of the best completed jobs.
    pub fn best_jobs_working_dirs(&self, how_many: usize) -> Vec<PathBuf> {
        let available = self.full_df.len();
        let how_many = if how_many > available {
            warn!(
                "requesting more best job working directories than data is available, reducing \
                 number to {available}"
            );
            available
        } else {
            how_many
        };

        self.full_df
            .best_rows(&self.metric_to_optimize, how_many, self.minimize)
            .rows()
            .filter_map(|row| row.get(WORKING_DIR))
            .map(|value| PathBuf::from(value.to_string()))
            .collect()
    }
}

/// Builds the optimizer for an iterative optimization run.
///
/// If a snapshot from an earlier run exists in the results directory, the
/// optimizer resumes from it; a snapshot optimizing a different metric is
/// refused.
pub fn initialize_optimizer(
    result_dir: &Path,
    optimizer_str: &str,
    specs: &[DistributionSpec],
    metric_to_optimize: &str,
    minimize: bool,
    optimizer_settings: &serde_json::Value,
) -> Result<Box<dyn Optimizer>> {
    match optimizer_str {
        "cem_metaoptimizer" => {
            let snapshot = result_dir.join(STATUS_SNAPSHOT_FILE);
            let loaded = CemMetaoptimizer::try_load_from_snapshot(
                &snapshot,
                specs,
                metric_to_optimize,
                minimize,
                optimizer_settings,
            )
            .with_context(|| {
                format!(
                    "failed to load optimizer snapshot `{path}`",
                    path = snapshot.display()
                )
            })?;
            match loaded {
                Some(optimizer) => {
                    info!("optimization status loaded");
                    Ok(Box::new(optimizer))
                }
                None => {
                    info!("no earlier optimization status found, starting new optimization");
                    Ok(Box::new(CemMetaoptimizer::new(
                        specs,
                        metric_to_optimize,
                        minimize,
                        optimizer_settings,
                    )?))
                }
            }
        }
        other => Err(EngineError::Settings(format!(
            "unknown optimizer `{other}`; available: cem_metaoptimizer, gridsearch"
        ))
        .into()),
    }
}
