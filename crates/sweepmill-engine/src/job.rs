//! The job model.
//!
//! A [`Job`] is one scheduled execution of the user program for one
//! parameter setting. The orchestrator owns all jobs and is the only writer
//! of their state; backends and the communication server report observations
//! back to it.

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use indexmap::IndexMap;
use tracing::debug;
use tracing::info;

use crate::constants::CLUSTER_METRIC_FILE;
use crate::constants::CLUSTER_PARAM_FILE;
use crate::constants::ID;
use crate::constants::JSON_SETTINGS_FILE;
use crate::params::ParamTree;
use crate::params::ParamValue;
use crate::results::Row;
use crate::results::Table;
use crate::results::write_one_row_csv;
use crate::settings::EnvironmentSetup;
use crate::settings::Paths;
use crate::settings::SingularitySettings;

/// An opaque job identifier assigned by a cluster backend at submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterJobId(pub String);

impl fmt::Display for ClusterJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle state of a job.
///
/// Transitions are monotonic in declaration order, with one exception: a job
/// that exits for resume moves from `Submitted`/`Running` back to `Submitted`
/// once it has been handed to the backend again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// The job has been created but not submitted.
    Initial,
    /// The job has been handed to the backend.
    Submitted,
    /// The job reported that it started executing.
    Running,
    /// The job failed.
    Failed,
    /// The job sent its final metrics but has not concluded yet.
    SentResults,
    /// The job concluded after sending results.
    Concluded,
    /// The job concluded without having sent results.
    ///
    /// A grace timer decides whether late results still arrive or the job is
    /// considered failed.
    ConcludedWithoutResults,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::Submitted => write!(f, "submitted"),
            Self::Running => write!(f, "running"),
            Self::Failed => write!(f, "failed"),
            Self::SentResults => write!(f, "sent results"),
            Self::Concluded => write!(f, "concluded"),
            Self::ConcludedWithoutResults => write!(f, "concluded without results"),
        }
    }
}

/// One scheduled execution of the user program for one parameter setting.
#[derive(Debug)]
pub struct Job {
    /// The monotonically increasing job identifier.
    pub id: usize,
    /// The identifier assigned by the backend; changes on resume.
    pub cluster_id: Option<ClusterJobId>,
    /// The optimizer-proposed parameter setting.
    pub settings: ParamTree,
    /// User-supplied parameters passed to every job unchanged.
    pub other_params: ParamTree,
    /// The 1-based optimizer round this job belongs to.
    pub iteration: usize,
    /// The name of the metric the optimizer ranks by.
    pub metric_to_watch: Option<String>,
    /// The current lifecycle state.
    pub status: JobStatus,
    /// The host the job reported it is executing on.
    pub hostname: Option<String>,
    /// When the job reported that it started.
    pub start_time: Option<Instant>,
    /// The estimated completion time derived from progress reports.
    pub estimated_end: Option<Instant>,
    /// Whether a resume re-submission is due.
    pub waiting_for_resume: bool,
    /// Intermediate values of the watched metric, in arrival order.
    pub reported_metric_values: Vec<f64>,
    /// The final metrics of the job.
    pub metrics: Option<IndexMap<String, f64>>,
    /// The error text of a failed job.
    pub error_info: Option<String>,
    /// Whether the optimizer has already been told about this job.
    pub results_used_for_update: bool,
    /// The run script rendered for this job.
    pub run_script_path: Option<PathBuf>,
    /// The backend job-spec file rendered for this job.
    pub job_spec_file_path: Option<PathBuf>,
    /// The name of the procedure this job belongs to.
    pub opt_procedure_name: String,
    /// The address of the communication server, threaded into the command
    /// line.
    server: SocketAddr,
    /// The merged setting the job actually ran with.
    ///
    /// Set when the execution command is generated (or when prior results
    /// are loaded from disk).
    final_settings: Option<ParamTree>,
    /// The assembled result row and its parameter/metric column names.
    results: Option<(Row, Vec<String>, Vec<String>)>,
}

impl Job {
    /// Creates a new job in the initial state.
    pub fn new(
        id: usize,
        settings: ParamTree,
        other_params: ParamTree,
        iteration: usize,
        server: SocketAddr,
        metric_to_watch: Option<String>,
        opt_procedure_name: String,
    ) -> Self {
        Self {
            id,
            cluster_id: None,
            settings,
            other_params,
            iteration,
            metric_to_watch,
            status: JobStatus::Initial,
            hostname: None,
            start_time: None,
            estimated_end: None,
            waiting_for_resume: false,
            reported_metric_values: Vec::new(),
            metrics: None,
            error_info: None,
            results_used_for_update: false,
            run_script_path: None,
            job_spec_file_path: None,
            opt_procedure_name,
            server,
            final_settings: None,
            results: None,
        }
    }

    /// The working directory of this job.
    pub fn working_dir(&self, paths: &Paths) -> PathBuf {
        paths.current_result_dir.join(self.id.to_string())
    }

    /// Builds the merged setting the job runs with.
    ///
    /// Optimizer-proposed settings are overlaid with the fixed parameters,
    /// then the working directory and job id are added.
    fn generate_final_setting(&self, paths: &Paths) -> ParamTree {
        let mut setting = self.settings.clone();
        setting.merge(&self.other_params);
        setting.insert_path(
            crate::constants::WORKING_DIR,
            ParamValue::String(self.working_dir(paths).display().to_string()),
        );
        setting.insert_path("id", ParamValue::Int(self.id as i64));
        setting
    }

    /// Generates the shell command block that executes the job.
    ///
    /// The block changes into the project directory, prepares the
    /// environment, and runs the user script with the job id, the
    /// communication server address, and the full parameter setting as
    /// arguments. `cmd_prefix` wraps the user command in a backend-specific
    /// runner (e.g. `srun` on Slurm).
    pub fn generate_execution_cmd(
        &mut self,
        paths: &Paths,
        env: &EnvironmentSetup,
        cmd_prefix: Option<&str>,
    ) -> Result<String> {
        let setting = self.generate_final_setting(paths);

        let set_cwd = format!("cd {path}", path = paths.main_path.display());

        let virtual_env_activate = env
            .virtual_env_path
            .as_ref()
            .map(|p| format!("source {path}", path = p.join("bin/activate").display()))
            .unwrap_or_default();

        let conda_env_activate = env
            .conda_env_path
            .as_ref()
            .map(|p| format!("conda activate {path}", path = p.display()))
            .unwrap_or_default();

        let set_env_variables = env
            .variables
            .iter()
            .map(|(name, value)| format!("export {name}=\"{value}\""))
            .collect::<Vec<_>>()
            .join("\n");

        let pre_job_script = env
            .pre_job_script
            .as_ref()
            .map(|p| format!("./{path}", path = p.display()))
            .unwrap_or_default();

        let setting_json = serde_json::to_string(&setting)?;
        let arguments = format!(
            "--job-id={id} --cluster-utils-server={server} --parameter-dict \"{setting}\"",
            id = self.id,
            server = self.server,
            setting = setting_json.replace('\\', "\\\\").replace('"', "\\\""),
        );

        let mut exec_cmd = if env.is_python_script {
            let python = env.python_executable.as_deref().unwrap_or("python3");
            if env.run_as_module {
                let module = paths
                    .script_to_run
                    .with_extension("")
                    .display()
                    .to_string()
                    .replace('/', ".");
                format!("{python} -m {module} {arguments}")
            } else {
                let script = paths.main_path.join(&paths.script_to_run);
                format!("{python} {script} {arguments}", script = script.display())
            }
        } else {
            let script = paths.main_path.join(&paths.script_to_run);
            format!("{script} {arguments}", script = script.display())
        };

        if let Some(singularity) = &env.singularity {
            let working_dir = self.working_dir(paths);
            exec_cmd = singularity_wrap(
                &exec_cmd,
                singularity,
                &paths.main_path,
                &working_dir,
                &env.variables,
            )?;
        }

        if let Some(prefix) = cmd_prefix {
            exec_cmd = format!("{prefix} {exec_cmd}");
        }

        self.final_settings = Some(setting);

        Ok([
            set_cwd,
            virtual_env_activate,
            conda_env_activate,
            set_env_variables,
            pre_job_script,
            exec_cmd,
        ]
        .join("\n"))
    }

    /// Writes the job's setting files into its working directory.
    ///
    /// `settings.json` holds the full nested setting and `param_choice.csv`
    /// its flattened one-row form. Must be called after the execution
    /// command was generated.
    pub fn write_settings_files(&self, paths: &Paths) -> Result<()> {
        let setting = self
            .final_settings
            .as_ref()
            .context("execution command was not generated yet")?;

        let working_dir = self.working_dir(paths);
        std::fs::create_dir_all(&working_dir).with_context(|| {
            format!(
                "failed to create working directory `{path}`",
                path = working_dir.display()
            )
        })?;

        let json = serde_json::to_string_pretty(setting)?;
        std::fs::write(working_dir.join(JSON_SETTINGS_FILE), json)?;

        let row: Row = setting
            .flatten()
            .into_iter()
            .collect();
        write_one_row_csv(&row, &working_dir.join(CLUSTER_PARAM_FILE))
    }

    /// Assembles the result row once final metrics are known.
    ///
    /// The row consists of the flattened parameters (plus the job id) and
    /// the metric values.
    pub fn set_results(&mut self) -> Result<()> {
        let Some(setting) = &self.final_settings else {
            bail!("job {id} has no final settings to assemble results from", id = self.id);
        };
        let Some(metrics) = &self.metrics else {
            bail!("job {id} has no metrics to assemble results from", id = self.id);
        };

        let mut row: Row = setting.flatten();
        row.insert(ID.to_string(), ParamValue::Int(self.id as i64));
        let param_columns: Vec<String> = row.keys().cloned().collect();

        let mut metric_columns = Vec::with_capacity(metrics.len());
        for (name, value) in metrics {
            row.insert(name.clone(), ParamValue::Float(*value));
            metric_columns.push(name.clone());
        }

        self.results = Some((row, param_columns, metric_columns));
        Ok(())
    }

    /// Gets the assembled result row, if any.
    pub fn results(&self) -> Option<&(Row, Vec<String>, Vec<String>)> {
        self.results.as_ref()
    }

    /// Determines if the job produced a usable result row.
    pub fn has_results(&self) -> bool {
        self.results.is_some()
    }

    /// Tries to load prior metrics from the job's working directory.
    ///
    /// When a metrics file exists, the job is marked concluded without ever
    /// being submitted.
    pub fn try_load_results_from_filesystem(&mut self, paths: &Paths) -> Result<()> {
        let metric_file = self.working_dir(paths).join(CLUSTER_METRIC_FILE);
        if !metric_file.is_file() {
            return Ok(());
        }

        let table = Table::read_csv(&metric_file)?;
        let Some(row) = table.row(0) else {
            return Ok(());
        };
        let metrics: IndexMap<String, f64> = row
            .iter()
            .filter_map(|(name, value)| value.as_f64().map(|v| (name.clone(), v)))
            .collect();

        info!(
            "job {id} loaded final results {metrics:?} from the filesystem; will not run",
            id = self.id
        );
        self.final_settings = Some(self.generate_final_setting(paths));
        self.metrics = Some(metrics);
        self.set_results()?;
        self.status = JobStatus::Concluded;
        Ok(())
    }

    /// Marks the job as failed, recording the error text.
    pub fn mark_failed(&mut self, error_message: impl Into<String>) {
        debug!(
            "mark job {id} (cluster id: {cluster_id:?}) as failed",
            id = self.id,
            cluster_id = self.cluster_id
        );
        self.status = JobStatus::Failed;
        self.error_info = Some(error_message.into());
    }

    /// Gets the estimated time until completion, if known.
    pub fn time_left(&self) -> Option<Duration> {
        self.estimated_end
            .map(|end| end.saturating_duration_since(Instant::now()))
    }

    /// Formats a remaining duration as `<h>h,<m>m`.
    pub fn time_left_to_str(time_left: Duration) -> String {
        let secs = time_left.as_secs();
        format!("{h}h,{m}m", h = secs / 3600, m = (secs % 3600) / 60)
    }
}

/// Wraps a command to execute inside a Singularity container.
///
/// Binds `/tmp`, the working directory, and the project directory into the
/// container and forwards the environment variables.
fn singularity_wrap(
    exec_cmd: &str,
    settings: &SingularitySettings,
    exec_dir: &Path,
    working_dir: &Path,
    variables: &IndexMap<String, String>,
) -> Result<String> {
    let image: PathBuf = shellexpand::tilde(&settings.image.display().to_string())
        .into_owned()
        .into();
    if !image.exists() {
        bail!(
            "Singularity image `{image}` does not exist",
            image = image.display()
        );
    }

    // The working directory is bound into the container, so it has to exist
    // before the container starts.
    std::fs::create_dir_all(working_dir).with_context(|| {
        format!(
            "failed to create working directory `{path}`",
            path = working_dir.display()
        )
    })?;

    let cwd = exec_dir.display();
    let mut parts = vec![
        settings.executable.clone(),
        if settings.use_run { "run" } else { "exec" }.to_string(),
        format!(
            "--bind=/tmp,{working_dir},{cwd}",
            working_dir = working_dir.display()
        ),
        format!("--pwd={cwd}"),
    ];
    for (name, value) in variables {
        parts.push(format!("--env {name}=\"{value}\""));
    }
    parts.extend(settings.args.iter().cloned());
    parts.push(image.display().to_string());

    Ok(format!("{wrapper} {exec_cmd}", wrapper = parts.join(" ")))
}
