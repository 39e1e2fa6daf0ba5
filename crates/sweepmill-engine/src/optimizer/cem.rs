//! The cross-entropy-method metaoptimizer.
//!
//! Samples settings from per-parameter distributions and refits those
//! distributions to the elite configurations after every batch of results.
//! With restarts enabled, a fraction of proposals re-runs one of the elite
//! configurations instead of sampling fresh, so promising settings gather
//! repetitions and their averages become trustworthy.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use super::Optimizer;
use super::OptimizerData;
use crate::constants::STATUS_SNAPSHOT_FILE;
use crate::distributions::Distribution;
use crate::error::EngineError;
use crate::job::Job;
use crate::params::ParamTree;
use crate::params::ParamValue;
use crate::results::Table;
use crate::settings::DistributionSpec;

/// The version of the snapshot format.
const SNAPSHOT_VERSION: u32 = 1;

/// The probability of sampling fresh (rather than restarting an elite
/// configuration) when restarts are enabled.
const FRESH_SAMPLE_PROBABILITY: f64 = 0.8;

/// The minimum elite size.
const MIN_ELITE_SIZE: usize = 5;

/// The tunables of the metaoptimizer, from `optimizer_settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct CemSettings {
    /// How many of the best configurations form the elite.
    #[serde(default = "default_elite_size")]
    num_jobs_in_elite: usize,
    /// Whether a fraction of proposals re-runs elite configurations.
    #[serde(default)]
    with_restarts: bool,
}

/// The default elite size.
fn default_elite_size() -> usize {
    10
}

impl CemSettings {
    /// Parses the settings, treating an absent value as all-defaults.
    fn from_value(value: &serde_json::Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self {
                num_jobs_in_elite: default_elite_size(),
                with_restarts: false,
            });
        }
        serde_json::from_value(value.clone())
            .map_err(|e| EngineError::Settings(format!("invalid optimizer_settings: {e}")).into())
    }
}

/// The on-disk snapshot of the metaoptimizer.
#[derive(Debug, Serialize, Deserialize)]
struct CemSnapshot {
    /// The snapshot format version.
    version: u32,
    /// The bookkeeping tables and metric.
    data: OptimizerData,
    /// The fitted distributions.
    distributions: Vec<Distribution>,
    /// The elite size.
    num_jobs_in_elite: usize,
    /// Whether restart mixing was enabled.
    with_restarts: bool,
}

/// The cross-entropy-method metaoptimizer.
#[derive(Debug)]
pub struct CemMetaoptimizer {
    /// The bookkeeping tables and metric.
    data: OptimizerData,
    /// The per-parameter distributions proposals are drawn from.
    distributions: Vec<Distribution>,
    /// How many of the best configurations form the elite.
    num_jobs_in_elite: usize,
    /// Whether a fraction of proposals re-runs elite configurations.
    with_restarts: bool,
}

impl CemMetaoptimizer {
    /// Constructs a fresh metaoptimizer from distribution specs.
    pub fn new(
        specs: &[DistributionSpec],
        metric_to_optimize: &str,
        minimize: bool,
        optimizer_settings: &serde_json::Value,
    ) -> Result<Self> {
        let settings = CemSettings::from_value(optimizer_settings)?;
        let distributions = specs
            .iter()
            .map(Distribution::from_spec)
            .collect::<Result<Vec<_>>>()?;
        let params = distributions
            .iter()
            .map(|d| d.param_name().to_string())
            .collect();

        Ok(Self {
            data: OptimizerData::new(metric_to_optimize.to_string(), minimize, params),
            distributions,
            num_jobs_in_elite: settings.num_jobs_in_elite.max(MIN_ELITE_SIZE),
            with_restarts: settings.with_restarts,
        })
    }

    /// Tries to resume the metaoptimizer from a snapshot file.
    ///
    /// Returns `Ok(None)` when no snapshot exists. A snapshot whose metric
    /// or optimization direction differs from the requested one is refused.
    /// The caller's distributions replace the stored ones and are refitted
    /// to the stored elite, so changed bounds take effect on resume.
    pub fn try_load_from_snapshot(
        file: &Path,
        specs: &[DistributionSpec],
        metric_to_optimize: &str,
        minimize: bool,
        optimizer_settings: &serde_json::Value,
    ) -> Result<Option<Self>> {
        if !file.exists() {
            return Ok(None);
        }

        let settings = CemSettings::from_value(optimizer_settings)?;
        let content = std::fs::read_to_string(file)
            .with_context(|| format!("failed to read `{path}`", path = file.display()))?;
        let snapshot: CemSnapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse `{path}`", path = file.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "snapshot version {version} is not supported",
                version = snapshot.version
            );
        }
        if (metric_to_optimize, minimize)
            != (snapshot.data.metric_to_optimize.as_str(), snapshot.data.minimize)
        {
            return Err(EngineError::SnapshotMismatch.into());
        }

        let distributions = specs
            .iter()
            .map(Distribution::from_spec)
            .collect::<Result<Vec<_>>>()?;
        let mut optimizer = Self {
            data: snapshot.data,
            distributions,
            num_jobs_in_elite: settings.num_jobs_in_elite.max(MIN_ELITE_SIZE),
            with_restarts: settings.with_restarts,
        };
        optimizer.data.params = optimizer
            .distributions
            .iter()
            .map(|d| d.param_name().to_string())
            .collect();
        optimizer.refit_distributions();
        Ok(Some(optimizer))
    }

    /// The per-parameter values of the elite configurations.
    fn get_best_params(&self) -> IndexMap<String, Vec<ParamValue>> {
        let best = self.data.minimal_df.best_rows(
            &self.data.metric_to_optimize,
            self.num_jobs_in_elite,
            self.data.minimize,
        );
        self.data
            .params
            .iter()
            .map(|param| {
                let values = best
                    .rows()
                    .filter_map(|row| row.get(param).cloned())
                    .collect();
                (param.clone(), values)
            })
            .collect()
    }

    /// Refits every distribution to the current elite.
    fn refit_distributions(&mut self) {
        let best = self.get_best_params();
        for distribution in &mut self.distributions {
            if let Some(values) = best.get(distribution.param_name()) {
                if !values.is_empty() {
                    distribution.fit(values);
                }
            }
        }
    }

    /// Samples a fresh setting from the distributions.
    fn sample_fresh(&mut self) -> ParamTree {
        let mut pairs = Vec::with_capacity(self.distributions.len());
        for distribution in &mut self.distributions {
            distribution.prepare_samples(1);
            pairs.push((distribution.param_name().to_string(), distribution.sample()));
        }
        ParamTree::from_flat(pairs)
    }

    /// Picks one of the better elite configurations to run again.
    fn random_setting_to_restart(&self) -> ParamTree {
        let best = self.get_best_params();
        let length = best.values().map(Vec::len).min().unwrap_or(0);
        if length == 0 {
            // Nothing to restart from; this only happens before any result
            // arrived, where the caller samples fresh anyway.
            return ParamTree::new();
        }
        let index = rand::rng().random_range(0..(length / 2).max(1));
        ParamTree::from_flat(
            best.into_iter()
                .map(|(param, values)| (param, values[index].clone())),
        )
    }
}

impl Optimizer for CemMetaoptimizer {
    fn ask(&mut self) -> Option<ParamTree> {
        let sample_fresh = !self.with_restarts
            || self.data.minimal_df.len() < self.num_jobs_in_elite
            || rand::rng().random::<f64>() < FRESH_SAMPLE_PROBABILITY;
        if sample_fresh {
            Some(self.sample_fresh())
        } else {
            Some(self.random_setting_to_restart())
        }
    }

    fn tell(&mut self, jobs: Vec<&mut Job>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        self.data.tell_rows(jobs)?;
        self.refit_distributions();
        Ok(())
    }

    fn iteration(&self) -> usize {
        self.data.iteration
    }

    fn advance_iteration(&mut self) {
        self.data.iteration += 1;
    }

    fn full_df(&self) -> &Table {
        &self.data.full_df
    }

    fn minimal_df(&self) -> &Table {
        &self.data.minimal_df
    }

    fn metric_to_optimize(&self) -> Option<&str> {
        Some(&self.data.metric_to_optimize)
    }

    fn minimize(&self) -> bool {
        self.data.minimize
    }

    fn save_data_and_self(&self, directory: &Path) -> Result<()> {
        self.data.save_tables(directory)?;

        let snapshot = CemSnapshot {
            version: SNAPSHOT_VERSION,
            data: self.data.clone(),
            distributions: self.distributions.clone(),
            num_jobs_in_elite: self.num_jobs_in_elite,
            with_restarts: self.with_restarts,
        };
        let path = directory.join(STATUS_SNAPSHOT_FILE);
        let json = serde_json::to_string(&snapshot)?;
        std::fs::write(&path, json)
            .with_context(|| format!("failed to write `{path}`", path = path.display()))
    }

    fn best_jobs_working_dirs(&self, how_many: usize) -> Vec<PathBuf> {
        self.data.best_jobs_working_dirs(how_many)
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::settings::EnvironmentSetup;
    use crate::settings::Paths;

    /// Builds a two-parameter metaoptimizer.
    fn test_optimizer() -> CemMetaoptimizer {
        let specs = vec![
            DistributionSpec {
                param: "lr".to_string(),
                distribution: "TruncatedLogNormal".to_string(),
                bounds: Some([1e-5, 1.0]),
                options: None,
            },
            DistributionSpec {
                param: "layers".to_string(),
                distribution: "IntNormal".to_string(),
                bounds: Some([1.0, 8.0]),
                options: None,
            },
        ];
        CemMetaoptimizer::new(&specs, "loss", true, &serde_json::Value::Null).unwrap()
    }

    /// Builds a concluded job with the given setting and loss.
    fn concluded_job(id: usize, lr: f64, layers: i64, loss: f64, paths: &Paths) -> Job {
        let mut settings = ParamTree::new();
        settings.insert_path("lr", ParamValue::Float(lr));
        settings.insert_path("layers", ParamValue::Int(layers));
        let mut job = Job::new(
            id,
            settings,
            ParamTree::new(),
            1,
            "127.0.0.1:1".parse().unwrap(),
            Some("loss".to_string()),
            "test".to_string(),
        );
        job.generate_execution_cmd(paths, &EnvironmentSetup::default(), None)
            .unwrap();
        job.metrics = Some([("loss".to_string(), loss)].into_iter().collect());
        job.set_results().unwrap();
        job.status = crate::job::JobStatus::Concluded;
        job
    }

    /// Builds paths rooted in the given directory.
    fn test_paths(root: &Path) -> Paths {
        Paths {
            main_path: root.join("project"),
            script_to_run: "main.py".into(),
            result_dir: root.join("results"),
            jobs_dir: root.join("jobs"),
            current_result_dir: root.join("results/working_directories"),
        }
    }

    #[test]
    fn ask_yields_settings_within_bounds() {
        let mut optimizer = test_optimizer();
        for _ in 0..10 {
            let setting = optimizer.ask().expect("CEM never exhausts");
            let lr = setting.get_path("lr").unwrap().as_f64().unwrap();
            assert!((1e-5..=1.0).contains(&lr));
            let layers = setting.get_path("layers").unwrap().as_f64().unwrap();
            assert!((1.0..=8.0).contains(&layers));
        }
    }

    #[test]
    fn tell_accumulates_and_marks_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let mut optimizer = test_optimizer();

        let mut jobs: Vec<Job> = (0..4)
            .map(|i| concluded_job(i, 0.01 * (i + 1) as f64, 2, i as f64, &paths))
            .collect();
        optimizer.tell(jobs.iter_mut().collect()).unwrap();

        assert_eq!(optimizer.full_df().len(), 4);
        assert!(jobs.iter().all(|j| j.results_used_for_update));
        // Sorted ascending by loss: the best row comes first.
        let best = optimizer.full_df().row(0).unwrap();
        assert_eq!(best["loss"], ParamValue::Float(0.0));
        assert_eq!(best["_iteration"], ParamValue::Int(1));
    }

    #[test]
    fn tell_rejects_missing_metric() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let mut optimizer = test_optimizer();

        let mut job = concluded_job(0, 0.01, 2, 1.0, &paths);
        job.metrics = Some([("accuracy".to_string(), 0.5)].into_iter().collect());
        job.set_results().unwrap();

        let error = optimizer
            .tell(vec![&mut job])
            .expect_err("missing metric should be rejected");
        assert!(error.to_string().contains("loss"));
        // The job still counts as told.
        assert!(job.results_used_for_update);
    }

    #[test]
    fn snapshot_round_trip_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let mut optimizer = test_optimizer();

        let mut jobs: Vec<Job> = (0..6)
            .map(|i| concluded_job(i, 0.01 * (i + 1) as f64, (i % 3 + 1) as i64, i as f64, &paths))
            .collect();
        optimizer.tell(jobs.iter_mut().collect()).unwrap();
        optimizer.advance_iteration();
        optimizer.save_data_and_self(dir.path()).unwrap();

        assert!(dir.path().join(STATUS_SNAPSHOT_FILE).exists());
        assert!(dir.path().join(crate::constants::FULL_DF_FILE).exists());
        assert!(dir.path().join(crate::constants::REDUCED_DF_FILE).exists());

        let specs = vec![
            DistributionSpec {
                param: "lr".to_string(),
                distribution: "TruncatedLogNormal".to_string(),
                bounds: Some([1e-5, 1.0]),
                options: None,
            },
            DistributionSpec {
                param: "layers".to_string(),
                distribution: "IntNormal".to_string(),
                bounds: Some([1.0, 8.0]),
                options: None,
            },
        ];
        let restored = CemMetaoptimizer::try_load_from_snapshot(
            &dir.path().join(STATUS_SNAPSHOT_FILE),
            &specs,
            "loss",
            true,
            &serde_json::Value::Null,
        )
        .unwrap()
        .expect("snapshot should load");

        assert_eq!(restored.iteration(), 1);
        assert_eq!(restored.full_df(), optimizer.full_df());
        assert_eq!(restored.minimal_df(), optimizer.minimal_df());
        assert_eq!(restored.data.params, optimizer.data.params);
    }

    #[test]
    fn snapshot_with_different_metric_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let optimizer = test_optimizer();
        optimizer.save_data_and_self(dir.path()).unwrap();

        let snapshot = dir.path().join(STATUS_SNAPSHOT_FILE);
        let result = CemMetaoptimizer::try_load_from_snapshot(
            &snapshot,
            &[],
            "accuracy",
            true,
            &serde_json::Value::Null,
        );
        assert!(result.is_err());

        let result = CemMetaoptimizer::try_load_from_snapshot(
            &snapshot,
            &[],
            "loss",
            false,
            &serde_json::Value::Null,
        );
        assert!(result.is_err());
    }

    #[test]
    fn missing_snapshot_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = CemMetaoptimizer::try_load_from_snapshot(
            &dir.path().join(STATUS_SNAPSHOT_FILE),
            &[],
            "loss",
            true,
            &serde_json::Value::Null,
        )
        .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn best_jobs_working_dirs_follow_the_metric() {
        let dir = tempfile::tempdir().unwrap();
        let paths = test_paths(dir.path());
        let mut optimizer = test_optimizer();

        let mut jobs: Vec<Job> = (0..3)
            .map(|i| concluded_job(i, 0.01, 2, 3.0 - i as f64, &paths))
            .collect();
        optimizer.tell(jobs.iter_mut().collect()).unwrap();

        let dirs = optimizer.best_jobs_working_dirs(2);
        assert_eq!(dirs.len(), 2);
        // Job 2 has the lowest loss.
        assert!(dirs[0].ends_with("2"));
    }
}
