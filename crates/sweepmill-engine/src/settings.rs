//! The settings file model.
//!
//! A run is described by a single JSON, YAML, or TOML file plus optional
//! `dotted.path=value` command line overrides. The file is normalized into a
//! JSON value, overrides are applied to that value, and the result is
//! deserialized into [`Settings`].

use std::path::Path;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::ParamValue;

use crate::error::EngineError;
use crate::params::ParamTree;
use crate::params::check_valid_param_name;
use crate::params::parse_override;
use crate::params::validate_fixed_params;

/// When to generate an optimization report.
///
/// Report rendering itself is provided by an external collaborator; the
/// orchestrator only decides when to trigger it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerateReport {
    /// Do not generate a report automatically.
    #[default]
    Never,
    /// Generate a report once when the optimization has finished.
    WhenFinished,
    /// Generate a report after every iteration of the optimization.
    EveryIteration,
}

/// Settings for wrapping job commands in a Singularity container.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SingularitySettings {
    /// Path to the Singularity image.
    pub image: PathBuf,
    /// The Singularity executable.
    ///
    /// Can be set to `apptainer` to explicitly use Apptainer instead.
    #[serde(default = "default_singularity_executable")]
    pub executable: String,
    /// Use `singularity run` instead of `singularity exec`.
    ///
    /// For images that use a run script for environment setup before
    /// executing the given command.
    #[serde(default)]
    pub use_run: bool,
    /// Additional arguments passed to Singularity.
    #[serde(default)]
    pub args: Vec<String>,
}

/// The default Singularity executable name.
fn default_singularity_executable() -> String {
    "singularity".to_string()
}

/// How the environment of a job is prepared before the user script runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentSetup {
    /// Path to a Python virtual environment to activate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtual_env_path: Option<PathBuf>,
    /// Path to a conda environment to activate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conda_env_path: Option<PathBuf>,
    /// A script executed in the job's shell before the user script.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_job_script: Option<PathBuf>,
    /// Environment variables exported into the job's shell.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub variables: IndexMap<String, String>,
    /// Singularity wrapping of the job command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub singularity: Option<SingularitySettings>,
    /// The Python interpreter used to run the user script.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub python_executable: Option<String>,
    /// Whether the user script is a Python script; default is `true`.
    ///
    /// Non-Python scripts are invoked directly.
    #[serde(default = "default_true")]
    pub is_python_script: bool,
    /// Invoke the user script as a Python module (`python -m pkg.mod`).
    #[serde(default)]
    pub run_as_module: bool,
}

impl Default for EnvironmentSetup {
    fn default() -> Self {
        Self {
            virtual_env_path: None,
            conda_env_path: None,
            pre_job_script: None,
            variables: IndexMap::new(),
            singularity: None,
            python_executable: None,
            is_python_script: true,
            run_as_module: false,
        }
    }
}

/// Helper for serde defaults of `true`.
fn default_true() -> bool {
    true
}

/// One entry of a grid search's `hyperparam_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HyperparamSpec {
    /// The (possibly dotted) parameter name.
    pub param: String,
    /// The values enumerated for this parameter.
    pub values: Vec<ParamValue>,
}

/// One entry of an optimization's `optimized_params`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DistributionSpec {
    /// The (possibly dotted) parameter name.
    pub param: String,
    /// The distribution kind (e.g. `TruncatedNormal`, `Discrete`).
    pub distribution: String,
    /// Lower and upper bound for numerical distributions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<[f64; 2]>,
    /// The option set for discrete distributions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<ParamValue>>,
}

/// The knobs of an iterative hyperparameter optimization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OptimizationSetting {
    /// The name of the scalar metric the optimizer ranks by.
    pub metric_to_optimize: String,
    /// Whether the metric is minimized (as opposed to maximized).
    pub minimize: bool,
    /// The total number of jobs to run.
    pub number_of_samples: usize,
    /// The number of jobs per optimizer iteration.
    pub n_jobs_per_iteration: usize,
    /// How many jobs must complete before the next batch is submitted.
    #[serde(default = "default_resubmit")]
    pub n_completed_jobs_before_resubmit: usize,
}

/// The default for `n_completed_jobs_before_resubmit`.
fn default_resubmit() -> usize {
    1
}

/// Thresholds of the bad-job early-killing heuristic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EarlyKillingParams {
    /// The rank a job must fall below to be considered bad.
    pub target_rank: f64,
    /// How many rank standard deviations of slack the job is given.
    pub how_many_stds: f64,
}

/// The top-level settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// The name of this optimization procedure.
    ///
    /// Used for the results directory and for job names on the cluster.
    pub optimization_procedure_name: String,
    /// The results directory, relative to the user's home directory.
    pub results_dir: PathBuf,
    /// The user script, relative to the project directory.
    pub script_relative_path: PathBuf,
    /// Run jobs from the current working directory.
    #[serde(default = "default_true")]
    pub run_in_working_dir: bool,
    /// Environment preparation for job commands.
    #[serde(default)]
    pub environment_setup: EnvironmentSetup,
    /// The backend-specific resource requirements.
    ///
    /// The mapping is interpreted by whichever backend is selected at run
    /// time, so it is kept untyped here.
    #[serde(default)]
    pub cluster_requirements: serde_json::Value,
    /// Parameters passed to every job unchanged.
    #[serde(default)]
    pub fixed_params: ParamTree,
    /// The enumerated parameter grid (grid search only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hyperparam_list: Option<Vec<HyperparamSpec>>,
    /// The optimized parameter distributions (hp optimization only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_params: Option<Vec<DistributionSpec>>,
    /// How often the grid is repeated (grid search only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restarts: Option<usize>,
    /// Random sample count short-circuiting full grid enumeration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<usize>,
    /// Reuse metrics files found in the working directories instead of
    /// re-running jobs (grid search only).
    #[serde(default)]
    pub load_existing_results: bool,
    /// The iterative optimization knobs (hp optimization only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimization_setting: Option<OptimizationSetting>,
    /// The optimizer registry key.
    #[serde(default = "default_optimizer")]
    pub optimizer_str: String,
    /// Optimizer-specific settings.
    #[serde(default)]
    pub optimizer_settings: serde_json::Value,
    /// How many of the best jobs have their working directories preserved.
    #[serde(default)]
    pub num_best_jobs_whose_data_is_kept: usize,
    /// Enable the bad-job early-killing heuristic.
    #[serde(default)]
    pub kill_bad_jobs_early: bool,
    /// Thresholds for the early-killing heuristic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_killing_params: Option<EarlyKillingParams>,
    /// Never prompt on the terminal; assume safe defaults.
    #[serde(default)]
    pub no_user_interaction: bool,
    /// Force (or forbid) the local backend when no cluster is detected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_local: Option<bool>,
    /// Remove the job scripts directory when the run finishes.
    #[serde(default = "default_true")]
    pub remove_jobs_dir: bool,
    /// Remove per-job working directories when they are no longer needed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_working_dirs: Option<bool>,
    /// When to generate an optimization report.
    #[serde(default)]
    pub generate_report: GenerateReport,
}

/// The default optimizer registry key.
fn default_optimizer() -> String {
    "cem_metaoptimizer".to_string()
}

impl Settings {
    /// Loads settings from a file, applying command line overrides.
    ///
    /// The format is chosen by file extension (`.json`, `.yml`/`.yaml`, or
    /// `.toml`). Overrides are `dotted.path=literal` strings applied to the
    /// raw settings value before deserialization.
    pub fn load(path: &Path, overrides: &[String]) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Settings(format!(
                "failed to read `{path}`: {e}",
                path = path.display()
            ))
        })?;

        let mut value: serde_json::Value = match path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
        {
            "json" => serde_json::from_str(&content)?,
            "yml" | "yaml" => serde_yaml_ng::from_str(&content)?,
            "toml" => {
                let parsed: toml::Value = toml::from_str(&content)?;
                serde_json::to_value(parsed)?
            }
            other => {
                return Err(EngineError::Settings(format!(
                    "`{path}` is not a supported settings file (unknown extension `{other}`)",
                    path = path.display()
                ))
                .into());
            }
        };

        for arg in overrides {
            let (name, override_value) = parse_override(arg)?;
            apply_override(&mut value, &name, serde_json::to_value(&override_value)?);
        }

        let settings: Settings = serde_json::from_value(value)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates parameter names and cross-field requirements.
    pub fn validate(&self) -> Result<(), EngineError> {
        let optimized_names = self.optimized_param_names();
        for name in &optimized_names {
            check_valid_param_name(name)?;
        }

        let mut seen = std::collections::HashSet::new();
        for name in &optimized_names {
            if !seen.insert(name) {
                return Err(EngineError::Settings(format!(
                    "duplicate entry `{name}` in the list of hyperparameters"
                )));
            }
        }

        validate_fixed_params(&self.fixed_params, &optimized_names)?;

        if let Some(setting) = &self.optimization_setting {
            if setting.n_jobs_per_iteration == 0 || setting.number_of_samples == 0 {
                return Err(EngineError::Settings(
                    "number_of_samples and n_jobs_per_iteration must be positive".to_string(),
                ));
            }
            let resubmit = setting.n_completed_jobs_before_resubmit;
            if !(1..=setting.n_jobs_per_iteration).contains(&resubmit) {
                return Err(EngineError::Settings(format!(
                    "n_completed_jobs_before_resubmit must be in [1, {max}]",
                    max = setting.n_jobs_per_iteration
                )));
            }
        }

        if self.kill_bad_jobs_early && self.early_killing_params.is_none() {
            warn!("kill_bad_jobs_early is set but early_killing_params is missing");
        }

        Ok(())
    }

    /// Gets the flattened names of all optimized parameters.
    pub fn optimized_param_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some(list) = &self.hyperparam_list {
            names.extend(list.iter().map(|h| h.param.clone()));
        }
        if let Some(list) = &self.optimized_params {
            names.extend(list.iter().map(|d| d.param.clone()));
        }
        names
    }
}

/// Sets a dotted path inside a raw JSON value, creating objects on the way.
fn apply_override(value: &mut serde_json::Value, path: &str, new_value: serde_json::Value) {
    let mut current = value;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = serde_json::Value::Object(Default::default());
        }
        let map = current.as_object_mut().expect("value was just made an object");
        if segments.peek().is_none() {
            map.insert(segment.to_string(), new_value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| serde_json::Value::Object(Default::default()));
    }
}

/// The directories and script locations of a run.
#[derive(Debug, Clone)]
pub struct Paths {
    /// The project directory jobs `cd` into before running.
    pub main_path: PathBuf,
    /// The user script, relative to `main_path`.
    pub script_to_run: PathBuf,
    /// The directory all results of the run are collected in.
    pub result_dir: PathBuf,
    /// The directory job scripts and their stdout/stderr/log files live in.
    pub jobs_dir: PathBuf,
    /// The directory holding one working directory per job.
    pub current_result_dir: PathBuf,
}

impl Paths {
    /// Builds the paths of a run from its settings.
    ///
    /// The results directory is `~/<results_dir>/<procedure name>`, job
    /// scripts go to a fresh directory under the user cache, and the
    /// project directory is the current working directory.
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        use anyhow::Context;

        let home = dirs::home_dir().context("failed to determine home directory")?;
        let result_dir = home
            .join(&settings.results_dir)
            .join(&settings.optimization_procedure_name);
        let time = crate::utils::get_time_string();
        let jobs_dir = crate::utils::make_temporary_dir(&format!(
            "{name}-{time}-jobs",
            name = settings.optimization_procedure_name,
        ))?;

        // Without `run_in_working_dir`, jobs run from a fresh copy of the
        // project (populated e.g. by a clone hook) instead of the live
        // working directory.
        let main_path = if settings.run_in_working_dir {
            std::env::current_dir().context("failed to determine working directory")?
        } else {
            crate::utils::make_temporary_dir(&format!(
                "{name}-{time}-project",
                name = settings.optimization_procedure_name,
            ))?
        };

        Ok(Self {
            main_path,
            script_to_run: settings.script_relative_path.clone(),
            current_result_dir: result_dir.join("working_directories"),
            result_dir,
            jobs_dir,
        })
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::params::ParamValue;

    /// A minimal grid search settings file.
    const MINIMAL: &str = r#"
    {
        "optimization_procedure_name": "test_grid",
        "results_dir": "experiments",
        "script_relative_path": "main.py",
        "cluster_requirements": {"request_cpus": 1},
        "fixed_params": {"z": 3},
        "hyperparam_list": [
            {"param": "x", "values": [0, 1]},
            {"param": "y", "values": [10, 20]}
        ],
        "restarts": 1
    }
    "#;

    /// Writes content to a named file in a fresh temporary directory.
    fn write_settings(name: &str, content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("should create temp dir");
        let path = dir.path().join(name);
        std::fs::write(&path, content).expect("should write settings");
        (dir, path)
    }

    #[test]
    fn loads_json_settings() {
        let (_dir, path) = write_settings("settings.json", MINIMAL);
        let settings = Settings::load(&path, &[]).expect("should load");
        assert_eq!(settings.optimization_procedure_name, "test_grid");
        assert_eq!(settings.hyperparam_list.as_ref().unwrap().len(), 2);
        assert_eq!(settings.restarts, Some(1));
        assert_eq!(settings.generate_report, GenerateReport::Never);
    }

    #[test]
    fn overrides_replace_nested_values() {
        let (_dir, path) = write_settings("settings.json", MINIMAL);
        let settings = Settings::load(
            &path,
            &[
                "optimization_procedure_name=renamed".to_string(),
                "fixed_params.z=4".to_string(),
            ],
        )
        .expect("should load");
        assert_eq!(settings.optimization_procedure_name, "renamed");
        assert_eq!(
            settings.fixed_params.get_path("z"),
            Some(&ParamValue::Int(4))
        );
    }

    #[test]
    fn loads_yaml_settings() {
        let yaml = r#"
optimization_procedure_name: yaml_run
results_dir: experiments
script_relative_path: main.py
cluster_requirements:
  partition: cpu
  request_cpus: 2
  memory_in_mb: 4000
  request_time: "8:00:00"
fixed_params:
  model:
    layers: 3
optimized_params:
  - param: model.lr
    distribution: TruncatedLogNormal
    bounds: [1.0e-5, 0.1]
optimization_setting:
  metric_to_optimize: loss
  minimize: true
  number_of_samples: 20
  n_jobs_per_iteration: 5
"#;
        let (_dir, path) = write_settings("settings.yaml", yaml);
        let settings = Settings::load(&path, &[]).expect("should load");
        assert_eq!(settings.optimization_procedure_name, "yaml_run");
        assert_eq!(
            settings.fixed_params.get_path("model.layers"),
            Some(&ParamValue::Int(3))
        );
        let opt = settings.optimization_setting.unwrap();
        assert_eq!(opt.metric_to_optimize, "loss");
        assert_eq!(opt.n_completed_jobs_before_resubmit, 1);
    }

    #[test]
    fn loads_toml_settings() {
        let toml = r#"
optimization_procedure_name = "toml_run"
results_dir = "experiments"
script_relative_path = "main.py"

[cluster_requirements]
request_cpus = 1

[[hyperparam_list]]
param = "x"
values = [1, 2]
"#;
        let (_dir, path) = write_settings("settings.toml", toml);
        let settings = Settings::load(&path, &[]).expect("should load");
        assert_eq!(settings.optimization_procedure_name, "toml_run");
        assert_eq!(settings.hyperparam_list.unwrap().len(), 1);
    }

    #[test]
    fn rejects_resubmit_outside_iteration_size() {
        let yaml = r#"
optimization_procedure_name: bad
results_dir: experiments
script_relative_path: main.py
optimization_setting:
  metric_to_optimize: loss
  minimize: true
  number_of_samples: 10
  n_jobs_per_iteration: 5
  n_completed_jobs_before_resubmit: 6
"#;
        let (_dir, path) = write_settings("settings.yaml", yaml);
        assert!(Settings::load(&path, &[]).is_err());
    }

    #[test]
    fn rejects_reserved_parameter_names() {
        let with_reserved = MINIMAL.replace("\"z\": 3", "\"working_dir\": \"/tmp\"");
        let (_dir, path) = write_settings("settings.json", &with_reserved);
        assert!(Settings::load(&path, &[]).is_err());
    }

    #[test]
    fn rejects_duplicate_hyperparams() {
        let duplicated = MINIMAL.replace("\"param\": \"y\"", "\"param\": \"x\"");
        let (_dir, path) = write_settings("settings.json", &duplicated);
        assert!(Settings::load(&path, &[]).is_err());
    }

    #[test]
    fn rejects_unknown_extension() {
        let (_dir, path) = write_settings("settings.ini", MINIMAL);
        assert!(Settings::load(&path, &[]).is_err());
    }

    #[test]
    fn parses_report_setting() {
        let with_report =
            MINIMAL.replace("\"restarts\": 1", "\"restarts\": 1, \"generate_report\": \"WHEN_FINISHED\"");
        let (_dir, path) = write_settings("settings.json", &with_report);
        let settings = Settings::load(&path, &[]).expect("should load");
        assert_eq!(settings.generate_report, GenerateReport::WhenFinished);
    }
}
