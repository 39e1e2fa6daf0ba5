//! The Slurm backend.
//!
//! Jobs are submitted with `sbatch` and cancelled with `scancel`. Failures
//! are detected by polling `sacct`, throttled to once per minute. Resumed
//! jobs are re-enqueued by the orchestrator and re-submitted with output
//! files opened in append mode so their logs concatenate.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use itertools::Itertools;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::run_submit_command;
use super::write_run_script;
use crate::constants::RETURN_CODE_FOR_RESUME;
use crate::constants::SUBMISSION_TIMEOUT;
use crate::error::EngineError;
use crate::job::ClusterJobId;
use crate::job::Job;
use crate::settings::EnvironmentSetup;
use crate::settings::Paths;

/// Minimum duration between two failure polls.
const CHECK_FOR_FAILURES_INTERVAL: Duration = Duration::from_secs(60);

/// The fields requested from `sacct`.
const SACCT_FORMAT: &str = "JobID,NodeList,State,ExitCode";

/// A Slurm job state as reported by `sacct`.
///
/// See <https://slurm.schedmd.com/job_state_codes.html>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum JobState {
    /// The job was terminated due to node boot failure.
    BootFail,
    /// The job was canceled by the user or administrator.
    Canceled,
    /// The job completed with an exit code of zero.
    Completed,
    /// The job was terminated due to exceeding a deadline.
    Deadline,
    /// The job finished with a non-zero exit code.
    Failed,
    /// The job was terminated due to node failure.
    NodeFail,
    /// The job ran out of memory.
    OutOfMemory,
    /// The job is queued and waiting for initiation.
    Pending,
    /// The job was terminated due to being preempted.
    Preempted,
    /// The job is currently running.
    Running,
    /// The job was requeued.
    Requeued,
    /// The job is about to change size.
    Resizing,
    /// The job was removed because a sibling cluster started it.
    Revoked,
    /// The job is suspended.
    Suspended,
    /// The job reached its time limit.
    Timeout,
}

impl JobState {
    /// Determines if the state indicates that the job failed.
    ///
    /// States of jobs that succeeded, are still queued, or are still running
    /// are not failures.
    fn is_failure(&self) -> bool {
        !matches!(
            self,
            Self::Completed
                | Self::Pending
                | Self::Running
                | Self::Requeued
                | Self::Resizing
                | Self::Suspended
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BootFail => write!(f, "BOOT_FAIL"),
            Self::Canceled => write!(f, "CANCELLED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Deadline => write!(f, "DEADLINE"),
            Self::Failed => write!(f, "FAILED"),
            Self::NodeFail => write!(f, "NODE_FAIL"),
            Self::OutOfMemory => write!(f, "OUT_OF_MEMORY"),
            Self::Pending => write!(f, "PENDING"),
            Self::Preempted => write!(f, "PREEMPTED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Requeued => write!(f, "REQUEUED"),
            Self::Resizing => write!(f, "RESIZING"),
            Self::Revoked => write!(f, "REVOKED"),
            Self::Suspended => write!(f, "SUSPENDED"),
            Self::Timeout => write!(f, "TIMEOUT"),
        }
    }
}

impl FromStr for JobState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // `sacct` may append details like "CANCELLED by 1234"; only the
        // first token carries the state.
        match s.split_whitespace().next().unwrap_or_default() {
            "BOOT_FAIL" => Ok(Self::BootFail),
            "CANCELLED" => Ok(Self::Canceled),
            "COMPLETED" => Ok(Self::Completed),
            "DEADLINE" => Ok(Self::Deadline),
            "FAILED" => Ok(Self::Failed),
            "NODE_FAIL" => Ok(Self::NodeFail),
            "OUT_OF_MEMORY" => Ok(Self::OutOfMemory),
            "PENDING" => Ok(Self::Pending),
            "PREEMPTED" => Ok(Self::Preempted),
            "RUNNING" => Ok(Self::Running),
            "REQUEUED" => Ok(Self::Requeued),
            "RESIZING" => Ok(Self::Resizing),
            "REVOKED" => Ok(Self::Revoked),
            "SUSPENDED" => Ok(Self::Suspended),
            "TIMEOUT" => Ok(Self::Timeout),
            other => bail!("unknown Slurm job state `{other}`"),
        }
    }
}

/// One job line of `sacct --parsable2` output.
#[derive(Debug)]
struct SacctRecord<'a> {
    /// The Slurm job identifier.
    job_id: &'a str,
    /// The node list the job ran on.
    node_list: &'a str,
    /// The state of the job, if recognized.
    state: Option<JobState>,
    /// The exit code of the job.
    exit_code: i32,
}

impl<'a> SacctRecord<'a> {
    /// Parses a line of `sacct` output.
    ///
    /// Returns `Ok(None)` for `.batch`/`.extern`/step sub-lines, which are
    /// ignored.
    fn parse(line: &'a str) -> Result<Option<Self>> {
        let mut parts = line.split('|');
        let job_id = parts.next().context("`sacct` output is missing job id")?;
        if job_id.contains('.') {
            return Ok(None);
        }
        let node_list = parts
            .next()
            .context("`sacct` output is missing node list")?;
        let state_str = parts.next().context("`sacct` output is missing state")?;
        let exit_code_field = parts
            .next()
            .context("`sacct` output is missing exit code")?;

        // The state may be unknown to us; unknown states never indicate a
        // failure on their own.
        let state = state_str.parse().ok();

        // The ExitCode field has the format `{exit_code}:{signal}`.
        let exit_code = exit_code_field
            .split(':')
            .next()
            .unwrap_or_default()
            .parse()
            .with_context(|| format!("invalid Slurm exit code `{exit_code_field}`"))?;

        Ok(Some(Self {
            job_id,
            node_list,
            state,
            exit_code,
        }))
    }
}

/// The cluster requirements understood by the Slurm backend.
#[derive(Debug, Clone, Deserialize)]
struct SlurmRequirements {
    /// The partition jobs are submitted to.
    partition: String,
    /// Requested CPUs per task.
    request_cpus: u32,
    /// Requested GPUs per task.
    #[serde(default)]
    request_gpus: u32,
    /// Requested memory, in megabytes.
    memory_in_mb: u64,
    /// The time limit in `sbatch` syntax.
    request_time: String,
    /// Hostnames jobs must not run on.
    #[serde(default)]
    forbidden_hostnames: Vec<String>,
    /// Raw `sbatch` options (already in `--name=value` form).
    #[serde(default)]
    extra_submission_options: Vec<String>,
}

/// The names `SlurmRequirements` consumes from the requirements mapping.
const KNOWN_REQUIREMENT_KEYS: &[&str] = &[
    "partition",
    "request_cpus",
    "request_gpus",
    "memory_in_mb",
    "request_time",
    "forbidden_hostnames",
    "extra_submission_options",
];

/// Builds the `#SBATCH` argument comment block of a run script.
#[derive(Debug, Default)]
struct SbatchArgs {
    /// The collected arguments in `--name=value` form.
    args: Vec<String>,
}

impl SbatchArgs {
    /// Adds an argument as `--name=value`.
    fn add(&mut self, name: &str, value: impl fmt::Display) {
        self.args.push(format!("--{name}={value}"));
    }

    /// Adds raw arguments that are already fully formed.
    fn extend_raw(&mut self, raw: &[String]) {
        self.args.extend(raw.iter().cloned());
    }

    /// Renders the block of `#SBATCH` comment lines.
    fn comment_block(&self) -> String {
        self.args
            .iter()
            .map(|arg| format!("#SBATCH {arg}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// The Slurm backend.
#[derive(Debug)]
pub struct SlurmBackend {
    /// The parsed requirements.
    requirements: SlurmRequirements,
    /// When failures were last polled.
    last_failure_check: Option<Instant>,
}

impl SlurmBackend {
    /// Builds the backend from a requirements mapping.
    pub fn new(requirements: &serde_json::Value) -> Result<Self> {
        let parsed: SlurmRequirements =
            serde_json::from_value(requirements.clone()).map_err(|e| {
                EngineError::Settings(format!(
                    "cluster_requirements settings for Slurm are invalid: {e}"
                ))
            })?;

        // Notify the user of entries the Slurm backend does not understand.
        if let Some(object) = requirements.as_object() {
            for key in object.keys() {
                if !KNOWN_REQUIREMENT_KEYS.contains(&key.as_str()) {
                    warn!(
                        "cluster_requirements contained entry `{key}` which is not supported by \
                         Slurm; it will be ignored"
                    );
                }
            }
        }

        Ok(Self {
            requirements: parsed,
            last_failure_check: None,
        })
    }

    /// Renders the `sbatch` run script for a job.
    fn generate_run_script(&self, job: &mut Job, paths: &Paths, env: &EnvironmentSetup) -> Result<()> {
        let script_name = format!("{iteration}_{id}.sh", iteration = job.iteration, id = job.id);
        let run_script_file_path = paths.jobs_dir.join(&script_name);
        let stdout_file = run_script_file_path.with_extension("out");
        let stderr_file = run_script_file_path.with_extension("err");

        let cmd = job.generate_execution_cmd(paths, env, Some("srun"))?;
        job.write_settings_files(paths)?;

        let mut args = SbatchArgs::default();
        args.add(
            "job-name",
            format!("{name}_{id}", name = job.opt_procedure_name, id = job.id),
        );
        args.add("output", stdout_file.display());
        args.add("error", stderr_file.display());
        args.add("partition", &self.requirements.partition);
        args.add("cpus-per-task", self.requirements.request_cpus);
        args.add("gpus-per-task", self.requirements.request_gpus);
        args.add("mem", format!("{}M", self.requirements.memory_in_mb));
        args.add("time", &self.requirements.request_time);
        args.add("nodes", 1);
        args.add("ntasks", 1);
        if !self.requirements.forbidden_hostnames.is_empty() {
            args.add("exclude", self.requirements.forbidden_hostnames.join(","));
        }
        args.extend_raw(&self.requirements.extra_submission_options);

        let script = format!(
            r#"#!/bin/bash
{sbatch_arg_lines}

# Submission ID {id}

echo "==== Start execution. ===="
echo "Job id: {id}, cluster id: ${{SLURM_JOB_ID}}, hostname: $(hostname), time: $(date)"
echo

{cmd}
rc=$?
if [[ $rc == {resume} ]]; then
    echo "exit with code {resume} for resume"
    # do not forward the exit code, as otherwise Slurm will think there was an error
    exit 0
elif [[ $rc != 0 ]]; then
    # add an indicator file to more easily identify failed jobs
    touch "{run_script_file_path}.FAILED"
    exit $rc
fi
"#,
            sbatch_arg_lines = args.comment_block(),
            id = job.id,
            resume = RETURN_CODE_FOR_RESUME,
            run_script_file_path = run_script_file_path.display(),
        );

        debug!(
            "write run script to {path}",
            path = run_script_file_path.display()
        );
        write_run_script(&run_script_file_path, &script)?;
        job.run_script_path = Some(run_script_file_path);
        Ok(())
    }

    /// Submits a job with `sbatch`.
    pub(super) async fn submit(
        &mut self,
        job: &mut Job,
        paths: &Paths,
        env: &EnvironmentSetup,
    ) -> Result<ClusterJobId> {
        // Only generate a run script for jobs that are submitted the first
        // time; re-submissions reuse it and append to its output files.
        if !job.waiting_for_resume {
            self.generate_run_script(job, paths, env)?;
        }
        let run_script = job
            .run_script_path
            .clone()
            .context("job has no run script")?;

        let mut command = Command::new("sbatch");
        command
            .arg("--open-mode=append")
            .arg(&run_script)
            .current_dir(&paths.jobs_dir);
        let stdout = run_submit_command(&mut command, job.id, SUBMISSION_TIMEOUT).await?;

        if stdout.is_empty() {
            return Err(EngineError::Submission(format!(
                "[Job #{id}] sbatch returned without error but did not print a cluster job id",
                id = job.id
            ))
            .into());
        }

        if stdout.lines().count() > 1 {
            warn!(
                "sbatch produced more than one line of output which is unexpected; please check \
                 the output for potential issues:\n{stdout}"
            );
        }

        extract_job_id_from_sbatch_output(&stdout)
    }

    /// Cancels a job with `scancel`.
    pub(super) async fn stop(&mut self, cluster_id: &ClusterJobId) {
        debug!("cancel job with cluster id {cluster_id}");
        let result = Command::new("scancel").arg(&cluster_id.0).output().await;
        if let Err(e) = result {
            error!("failed to run `scancel {cluster_id}`: {e}");
        }
    }

    /// Determines if enough time passed since the last failure poll.
    pub(super) fn is_ready_to_check_for_failed_jobs(&self) -> bool {
        match self.last_failure_check {
            Some(last) => last.elapsed() >= CHECK_FOR_FAILURES_INTERVAL,
            None => true,
        }
    }

    /// Queries `sacct` for the given jobs and marks failures.
    pub(super) async fn mark_failed_jobs(&mut self, jobs: Vec<&mut Job>) -> Result<()> {
        debug!("check for failed jobs");

        let mut job_map: HashMap<String, &mut Job> = jobs
            .into_iter()
            .filter_map(|job| job.cluster_id.clone().map(|id| (id.0, job)))
            .collect();
        if job_map.is_empty() {
            return Ok(());
        }

        let job_id_list = job_map.keys().join(",");
        let output = Command::new("sacct")
            .arg("--jobs")
            .arg(&job_id_list)
            .arg("--parsable2")
            .arg(format!("--format={SACCT_FORMAT}"))
            .arg("--noheader")
            .output()
            .await
            .context("failed to spawn `sacct`")?;
        if !output.status.success() {
            bail!(
                "`sacct` failed ({status}): {stderr}",
                status = output.status,
                stderr = String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        debug!("output of sacct:\n{stdout}");
        mark_failed_from_sacct_output(&stdout, &mut job_map)?;

        self.last_failure_check = Some(Instant::now());
        Ok(())
    }
}

/// Applies `sacct` output to the given jobs, marking failures.
fn mark_failed_from_sacct_output(
    output: &str,
    job_map: &mut HashMap<String, &mut Job>,
) -> Result<()> {
    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let Some(record) = SacctRecord::parse(line)? else {
            continue;
        };
        let Some(job) = job_map.get_mut(record.job_id) else {
            continue;
        };

        let state_failed = record.state.is_some_and(|s| s.is_failure());
        if record.exit_code != 0 || state_failed {
            // The hostname is used in the error message shown to the user.
            job.hostname = Some(record.node_list.to_string());

            let stderr_file = job
                .run_script_path
                .as_ref()
                .map(|p| p.with_extension("err"));
            let error_output = stderr_file
                .and_then(|p| std::fs::read_to_string(p).ok())
                .unwrap_or_default();

            let state = record
                .state
                .map(|s| s.to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string());
            job.mark_failed(format!(
                "Job failed with state {state} / exit code {code}.  Error output:\n{error_output}",
                code = record.exit_code
            ));
        }
    }
    Ok(())
}

/// Extracts the cluster job id from the stdout output of `sbatch`.
fn extract_job_id_from_sbatch_output(stdout: &str) -> Result<ClusterJobId> {
    // Output of a successful sbatch looks like this:
    // > Submitted batch job 4575177
    for line in stdout.lines() {
        if let Some(id) = line.trim().strip_prefix("Submitted batch job ") {
            return Ok(ClusterJobId(id.to_string()));
        }
    }
    Err(EngineError::Submission(format!(
        "could not find job id in output\n------\n{stdout}\n------"
    ))
    .into())
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::job::JobStatus;
    use crate::params::ParamTree;

    /// Builds a submitted job with the given cluster id.
    fn submitted_job(id: usize, cluster_id: &str) -> Job {
        let mut job = Job::new(
            id,
            ParamTree::new(),
            ParamTree::new(),
            1,
            "127.0.0.1:1".parse().unwrap(),
            None,
            "test".to_string(),
        );
        job.cluster_id = Some(ClusterJobId(cluster_id.to_string()));
        job.status = JobStatus::Submitted;
        job
    }

    #[test]
    fn state_failure_table() {
        for ok in ["COMPLETED", "PENDING", "RUNNING", "REQUEUED", "RESIZING", "SUSPENDED"] {
            let state: JobState = ok.parse().unwrap();
            assert!(!state.is_failure(), "{ok} should not be a failure");
        }
        for bad in [
            "BOOT_FAIL",
            "CANCELLED",
            "DEADLINE",
            "FAILED",
            "NODE_FAIL",
            "OUT_OF_MEMORY",
            "PREEMPTED",
            "REVOKED",
            "TIMEOUT",
        ] {
            let state: JobState = bad.parse().unwrap();
            assert!(state.is_failure(), "{bad} should be a failure");
        }
        assert!("CANCELLED by 1234".parse::<JobState>().is_ok());
        assert!("NO_SUCH_STATE".parse::<JobState>().is_err());
    }

    #[test]
    fn sacct_substeps_are_ignored() {
        let record = SacctRecord::parse("4597753.batch||FAILED|1:0").unwrap();
        assert!(record.is_none());
        let record = SacctRecord::parse("4597753.extern||COMPLETED|0:0").unwrap();
        assert!(record.is_none());

        let record = SacctRecord::parse("4597753|cpu-short|FAILED|1:0")
            .unwrap()
            .expect("job lines should parse");
        assert_eq!(record.job_id, "4597753");
        assert_eq!(record.node_list, "cpu-short");
        assert_eq!(record.state, Some(JobState::Failed));
        assert_eq!(record.exit_code, 1);
    }

    #[test]
    fn sacct_output_marks_failures() {
        let mut failed = submitted_job(0, "100");
        let mut running = submitted_job(1, "101");
        let mut oom = submitted_job(2, "102");

        let mut job_map: HashMap<String, &mut Job> = HashMap::new();
        job_map.insert("100".to_string(), &mut failed);
        job_map.insert("101".to_string(), &mut running);
        job_map.insert("102".to_string(), &mut oom);

        let output = "100|node-a|FAILED|1:0\n\
                      100.batch||FAILED|1:0\n\
                      101|node-b|RUNNING|0:0\n\
                      102|node-c|OUT_OF_MEMORY|0:125\n";
        mark_failed_from_sacct_output(output, &mut job_map).unwrap();

        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.hostname.as_deref(), Some("node-a"));
        assert!(
            failed
                .error_info
                .as_deref()
                .unwrap()
                .contains("state FAILED / exit code 1")
        );
        assert_eq!(running.status, JobStatus::Submitted);
        // A failing state marks the job failed even with exit code 0.
        assert_eq!(oom.status, JobStatus::Failed);
    }

    #[test]
    fn parses_sbatch_output() {
        let id = extract_job_id_from_sbatch_output("Submitted batch job 4575177\n").unwrap();
        assert_eq!(id, ClusterJobId("4575177".to_string()));
        assert!(extract_job_id_from_sbatch_output("nothing useful\n").is_err());
    }

    #[test]
    fn sbatch_args_render_as_comment_block() {
        let mut args = SbatchArgs::default();
        args.add("partition", "gpu");
        args.add("mem", "8000M");
        args.extend_raw(&["--gpu-freq=high".to_string()]);
        assert_eq!(
            args.comment_block(),
            "#SBATCH --partition=gpu\n#SBATCH --mem=8000M\n#SBATCH --gpu-freq=high"
        );
    }

    #[test]
    fn failure_poll_is_throttled() {
        let mut backend = SlurmBackend::new(&serde_json::json!({
            "partition": "cpu",
            "request_cpus": 1,
            "memory_in_mb": 1000,
            "request_time": "1:00:00",
        }))
        .unwrap();
        assert!(backend.is_ready_to_check_for_failed_jobs());
        backend.last_failure_check = Some(Instant::now());
        assert!(!backend.is_ready_to_check_for_failed_jobs());
    }
}
