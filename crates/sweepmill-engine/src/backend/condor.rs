//! The HTCondor backend.
//!
//! Jobs are submitted with `condor_submit_bid`. Resume handling lives in the
//! submit file: a job exiting with the resume code is put on hold and
//! periodically released by the scheduler, so the orchestrator never
//! re-enqueues it. Failures are detected by scraping the per-job scheduler
//! log for a non-zero return value.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use indexmap::IndexMap;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;
use tracing::error;

use super::run_submit_command;
use super::write_run_script;
use crate::constants::RETURN_CODE_FOR_RESUME;
use crate::constants::SUBMISSION_TIMEOUT;
use crate::error::EngineError;
use crate::job::ClusterJobId;
use crate::job::Job;
use crate::settings::EnvironmentSetup;
use crate::settings::Paths;

/// The token pool size concurrency limits are carved out of.
const MAX_NUM_TOKENS: u64 = 10_000;

/// Extra submission options, given either as raw lines or as a mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExtraOptions {
    /// Raw submit-file lines.
    Lines(Vec<String>),
    /// `key=value` pairs.
    Map(IndexMap<String, serde_json::Value>),
}

impl ExtraOptions {
    /// Renders the options as submit-file lines.
    fn to_lines(&self) -> Vec<String> {
        match self {
            Self::Lines(lines) => lines.clone(),
            Self::Map(map) => map
                .iter()
                .map(|(key, value)| format!("{key}={value}", value = display_value(value)))
                .collect(),
        }
    }
}

/// Formats a JSON value without quoting bare strings.
fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The cluster requirements understood by the Condor backend.
#[derive(Debug, Clone, Deserialize)]
struct CondorRequirements {
    /// Requested memory, in megabytes.
    memory_in_mb: u64,
    /// Requested CPU count.
    request_cpus: u32,
    /// Requested GPU count.
    #[serde(default)]
    request_gpus: u32,
    /// The bid submitted with every job.
    bid: u32,
    /// CUDA capability requirement (e.g. `>=7.5`, `5.0`, or a raw clause).
    #[serde(default)]
    cuda_requirement: Option<String>,
    /// Minimum GPU memory, in megabytes.
    #[serde(default)]
    gpu_memory_mb: Option<u64>,
    /// Allowed hostnames; any of them satisfies the requirement.
    #[serde(default)]
    hostname_list: Vec<String>,
    /// Hostnames jobs must not run on.
    #[serde(default)]
    forbidden_hostnames: Vec<String>,
    /// Tag for a user concurrency limit.
    #[serde(default)]
    concurrency_limit_tag: Option<String>,
    /// Maximum number of concurrently running jobs under the tag.
    #[serde(default)]
    concurrency_limit: Option<u64>,
    /// Extra raw submit-file lines.
    #[serde(default)]
    extra_submission_options: Option<ExtraOptions>,
}

/// The HTCondor backend.
#[derive(Debug)]
pub struct CondorBackend {
    /// Requested memory, in megabytes.
    mem: u64,
    /// Requested CPU count.
    cpus: u32,
    /// Requested GPU count.
    gpus: u32,
    /// The bid submitted with every job.
    bid: u32,
    /// The rendered `requirements=` line, if any.
    requirements_line: String,
    /// The rendered `concurrency_limits=` line, if any.
    concurrent_line: String,
    /// Extra submit-file lines.
    extra_submission_lines: String,
}

impl CondorBackend {
    /// Builds the backend from a requirements mapping.
    pub fn new(requirements: &serde_json::Value) -> Result<Self> {
        let req: CondorRequirements =
            serde_json::from_value(requirements.clone()).map_err(|e| {
                EngineError::Settings(format!(
                    "cluster_requirements settings for Condor are invalid: {e}"
                ))
            })?;

        let mut condor_requirements = Vec::new();
        if req.request_gpus > 0 {
            if let Some(cuda) = &req.cuda_requirement {
                let line = if cuda.starts_with('<') || cuda.starts_with('>') {
                    format!("TARGET.CUDACapability{cuda}")
                } else if cuda.parse::<f64>().is_ok() {
                    format!("TARGET.CUDACapability>={cuda}")
                } else {
                    cuda.clone()
                };
                condor_requirements.push(line);
            }
            if let Some(gpu_memory) = req.gpu_memory_mb {
                condor_requirements.push(format!("TARGET.CUDAGlobalMemoryMb>={gpu_memory}"));
            }
        }

        if !req.hostname_list.is_empty() {
            let single_reqs: Vec<String> = req
                .hostname_list
                .iter()
                .map(|hostname| format!("UtsnameNodename =?= \"{hostname}\""))
                .collect();
            condor_requirements.push(format!("({})", single_reqs.join(" || ")));
        }
        for hostname in &req.forbidden_hostnames {
            condor_requirements.push(format!("UtsnameNodename =!= \"{hostname}\""));
        }

        let requirements_line = if condor_requirements.is_empty() {
            String::new()
        } else {
            format!("requirements={}", condor_requirements.join(" && "))
        };

        let concurrent_line = match (&req.concurrency_limit_tag, req.concurrency_limit) {
            (Some(tag), Some(limit)) if limit > 0 => {
                let tokens = MAX_NUM_TOKENS / limit;
                format!("concurrency_limits=user.{tag}:{tokens}")
            }
            _ => String::new(),
        };

        let extra_submission_lines = match &req.extra_submission_options {
            Some(options) => format!("# Extra options\n{}", options.to_lines().join("\n")),
            None => String::new(),
        };

        Ok(Self {
            mem: req.memory_in_mb,
            cpus: req.request_cpus,
            gpus: req.request_gpus,
            bid: req.bid,
            requirements_line,
            concurrent_line,
            extra_submission_lines,
        })
    }

    /// Renders the run script and submit file for a job.
    fn generate_job_spec_file(
        &self,
        job: &mut Job,
        paths: &Paths,
        env: &EnvironmentSetup,
    ) -> Result<()> {
        let script_name = format!("{iteration}_{id}.sh", iteration = job.iteration, id = job.id);
        let run_script_file_path = paths.jobs_dir.join(&script_name);
        let job_spec_file_path = paths.jobs_dir.join(format!("{script_name}.sub"));

        let cmd = job.generate_execution_cmd(paths, env, None)?;
        job.write_settings_files(paths)?;

        let run_script = format!(
            r#"#!/bin/bash
# Submission ID {id}

{cmd}
rc=$?
if [[ $rc == 0 ]]; then
    rm -f {run_script_file_path}
    rm -f {job_spec_file_path}
elif [[ $rc == {resume} ]]; then
    echo "exit with code {resume} for resume"
    exit {resume}
else
    echo "Failed with exit code $rc"
    # add an indicator file to more easily identify failed jobs
    echo "$rc" > "{run_script_file_path}.FAILED"
    exit $rc
fi
"#,
            id = job.id,
            resume = RETURN_CODE_FOR_RESUME,
            run_script_file_path = run_script_file_path.display(),
            job_spec_file_path = job_spec_file_path.display(),
        );
        write_run_script(&run_script_file_path, &run_script)?;

        let spec_file = format!(
            r#"# Submission ID {id}
JobBatchName={procedure}
executable = {run_script_file_path}

error = {run_script_file_path}.err
output = {run_script_file_path}.out
log = {run_script_file_path}.log

request_cpus={cpus}
request_gpus={gpus}
request_memory={mem}

{requirements_line}

on_exit_hold = (ExitCode =?= {resume})
on_exit_hold_reason = "Checkpointed, will resume"
on_exit_hold_subcode = 2
periodic_release = ( (JobStatus =?= 5) && (HoldReasonCode =?= {resume}) && (HoldReasonSubCode =?= 2) )

# Inherit environment variables at submission time in job script
getenv=True

{concurrent_line}

{extra_submission_lines}

queue
"#,
            id = job.id,
            procedure = job.opt_procedure_name,
            run_script_file_path = run_script_file_path.display(),
            cpus = self.cpus,
            gpus = self.gpus,
            mem = self.mem,
            resume = RETURN_CODE_FOR_RESUME,
            requirements_line = self.requirements_line,
            concurrent_line = self.concurrent_line,
            extra_submission_lines = self.extra_submission_lines,
        );
        std::fs::write(&job_spec_file_path, spec_file).with_context(|| {
            format!(
                "failed to write `{path}`",
                path = job_spec_file_path.display()
            )
        })?;

        job.run_script_path = Some(run_script_file_path);
        job.job_spec_file_path = Some(job_spec_file_path);
        Ok(())
    }

    /// Submits a job with `condor_submit_bid`.
    pub(super) async fn submit(
        &mut self,
        job: &mut Job,
        paths: &Paths,
        env: &EnvironmentSetup,
    ) -> Result<ClusterJobId> {
        if !job.waiting_for_resume {
            self.generate_job_spec_file(job, paths, env)?;
        }
        let spec_file = job
            .job_spec_file_path
            .clone()
            .context("job has no spec file")?;

        let mut command = Command::new("condor_submit_bid");
        command
            .arg(self.bid.to_string())
            .arg(&spec_file)
            .current_dir(&paths.jobs_dir);
        let stdout = run_submit_command(&mut command, job.id, SUBMISSION_TIMEOUT).await?;

        parse_submit_output(&stdout).ok_or_else(|| {
            error!(
                "job with id {id} submitted to condor cluster, but job submission failed; \
                 submission output:\n{stdout}",
                id = job.id
            );
            EngineError::Submission("cluster submission failed".to_string()).into()
        })
    }

    /// Cancels a job with `condor_rm`.
    pub(super) async fn stop(&mut self, cluster_id: &ClusterJobId) {
        let result = Command::new("condor_rm").arg(&cluster_id.0).output().await;
        if let Err(e) = result {
            error!("failed to run `condor_rm {cluster_id}`: {e}");
        }
    }

    /// Scrapes the scheduler logs of the given jobs for failures.
    pub(super) fn mark_failed_jobs(&mut self, jobs: Vec<&mut Job>) {
        for job in jobs {
            let Some(run_script_path) = job.run_script_path.clone() else {
                continue;
            };
            let log_file = append_extension(&run_script_path, "log");
            let Ok(content) = std::fs::read_to_string(&log_file) else {
                continue;
            };

            let Some(return_value) = last_return_value(&content) else {
                continue;
            };
            if return_value == 0 || return_value == RETURN_CODE_FOR_RESUME {
                continue;
            }

            if let Some(hostname) = executing_host(&content) {
                job.hostname = Some(hostname);
            }

            let err_file = append_extension(&run_script_path, "err");
            let error_output = std::fs::read_to_string(&err_file).unwrap_or_else(|_| {
                format!(
                    "<could not read error file `{path}`>",
                    path = err_file.display()
                )
            });
            job.mark_failed(error_output);
            debug!(
                "job {id} failed with return value {return_value} according to `{log}`",
                id = job.id,
                log = log_file.display()
            );
        }
    }
}

/// Appends an extension to a path (`x.sh` + `log` = `x.sh.log`).
fn append_extension(path: &Path, extension: &str) -> PathBuf {
    let mut os_string = path.as_os_str().to_owned();
    os_string.push(".");
    os_string.push(extension);
    PathBuf::from(os_string)
}

/// Extracts the cluster id from `condor_submit_bid` output.
///
/// Lines containing `WARNING` or `ERROR` fail the submission; the id is the
/// trailing number of the line announcing the submitted job.
fn parse_submit_output(stdout: &str) -> Option<ClusterJobId> {
    let good_lines: Vec<&str> = stdout.lines().filter(|l| l.contains("submitted")).collect();
    let bad_lines: Vec<&str> = stdout
        .lines()
        .filter(|l| l.contains("WARNING") || l.contains("ERROR"))
        .collect();
    if good_lines.len() != 1 || !bad_lines.is_empty() {
        return None;
    }

    good_lines[0]
        .split_whitespace()
        .last()
        .map(|token| ClusterJobId(token.trim_end_matches('.').to_string()))
}

/// Extracts the last reported return value from a Condor job log.
fn last_return_value(log: &str) -> Option<i32> {
    let (_, after) = log.rsplit_once("return value ")?;
    let digits: String = after.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Extracts the executing host from a Condor job log.
fn executing_host(log: &str) -> Option<String> {
    let (_, after) = log.rsplit_once("Job executing on host: <")?;
    let host: String = after
        .chars()
        .take_while(|c| *c != ':' && *c != '>')
        .collect();
    (!host.is_empty()).then_some(host)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn builds_requirement_lines() {
        let backend = CondorBackend::new(&serde_json::json!({
            "memory_in_mb": 8000,
            "request_cpus": 4,
            "request_gpus": 1,
            "bid": 25,
            "cuda_requirement": "5.0",
            "gpu_memory_mb": 12000,
            "forbidden_hostnames": ["g007"],
        }))
        .expect("should build");

        assert_eq!(
            backend.requirements_line,
            "requirements=TARGET.CUDACapability>=5.0 && TARGET.CUDAGlobalMemoryMb>=12000 && \
             UtsnameNodename =!= \"g007\""
        );
    }

    #[test]
    fn cuda_comparison_operators_pass_through() {
        let backend = CondorBackend::new(&serde_json::json!({
            "memory_in_mb": 1000,
            "request_cpus": 1,
            "request_gpus": 1,
            "bid": 10,
            "cuda_requirement": ">=7.5",
        }))
        .expect("should build");
        assert_eq!(
            backend.requirements_line,
            "requirements=TARGET.CUDACapability>=7.5"
        );
    }

    #[test]
    fn hostname_list_becomes_disjunction() {
        let backend = CondorBackend::new(&serde_json::json!({
            "memory_in_mb": 1000,
            "request_cpus": 1,
            "bid": 10,
            "hostname_list": ["a", "b"],
        }))
        .expect("should build");
        assert_eq!(
            backend.requirements_line,
            "requirements=(UtsnameNodename =?= \"a\" || UtsnameNodename =?= \"b\")"
        );
    }

    #[test]
    fn concurrency_limit_divides_token_pool() {
        let backend = CondorBackend::new(&serde_json::json!({
            "memory_in_mb": 1000,
            "request_cpus": 1,
            "bid": 10,
            "concurrency_limit_tag": "gpu",
            "concurrency_limit": 20,
        }))
        .expect("should build");
        assert_eq!(backend.concurrent_line, "concurrency_limits=user.gpu:500");
    }

    #[test]
    fn gpu_requirements_ignored_without_gpus() {
        let backend = CondorBackend::new(&serde_json::json!({
            "memory_in_mb": 1000,
            "request_cpus": 1,
            "bid": 10,
            "cuda_requirement": "5.0",
        }))
        .expect("should build");
        assert_eq!(backend.requirements_line, "");
    }

    #[test]
    fn parses_submit_output() {
        let stdout = "Submitting job(s).\n1 job(s) submitted to cluster 6476353.\n";
        assert_eq!(
            parse_submit_output(stdout),
            Some(ClusterJobId("6476353".to_string()))
        );

        let with_warning = "WARNING: something\n1 job(s) submitted to cluster 1.\n";
        assert_eq!(parse_submit_output(with_warning), None);
        assert_eq!(parse_submit_output("no jobs here\n"), None);
    }

    #[test]
    fn reads_return_value_and_host_from_log() {
        let log = "005 (6476353.000.000) Job executing on host: <172.22.1.23:9618?addrs=...>\n\
                   ...\n\
                   Job terminated.\n\
                   (1) Normal termination (return value 1)\n";
        assert_eq!(last_return_value(log), Some(1));
        assert_eq!(executing_host(log), Some("172.22.1.23".to_string()));

        let resumed = "Job terminated.\n(1) Normal termination (return value 3)\n";
        assert_eq!(last_return_value(resumed), Some(3));
        assert_eq!(last_return_value("nothing here"), None);
    }

    #[test]
    fn marks_jobs_failed_from_log_files() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("1_0.sh");
        std::fs::write(&script, "#!/bin/bash\n").unwrap();
        std::fs::write(
            append_extension(&script, "log"),
            "Job executing on host: <172.22.9.9:9618>\nNormal termination (return value 1)\n",
        )
        .unwrap();
        std::fs::write(append_extension(&script, "err"), "boom\n").unwrap();

        let mut backend = CondorBackend::new(&serde_json::json!({
            "memory_in_mb": 1000,
            "request_cpus": 1,
            "bid": 10,
        }))
        .unwrap();

        let mut job = crate::job::Job::new(
            0,
            crate::params::ParamTree::new(),
            crate::params::ParamTree::new(),
            1,
            "127.0.0.1:1".parse().unwrap(),
            None,
            "test".to_string(),
        );
        job.run_script_path = Some(script);
        job.status = crate::job::JobStatus::Submitted;

        backend.mark_failed_jobs(vec![&mut job]);
        assert_eq!(job.status, crate::job::JobStatus::Failed);
        assert_eq!(job.error_info.as_deref(), Some("boom\n"));
        assert_eq!(job.hostname.as_deref(), Some("172.22.9.9"));
    }

    #[test]
    fn resume_return_value_is_not_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("1_0.sh");
        std::fs::write(
            append_extension(&script, "log"),
            "Normal termination (return value 3)\n",
        )
        .unwrap();

        let mut backend = CondorBackend::new(&serde_json::json!({
            "memory_in_mb": 1000,
            "request_cpus": 1,
            "bid": 10,
        }))
        .unwrap();

        let mut job = crate::job::Job::new(
            0,
            crate::params::ParamTree::new(),
            crate::params::ParamTree::new(),
            1,
            "127.0.0.1:1".parse().unwrap(),
            None,
            "test".to_string(),
        );
        job.run_script_path = Some(script);
        job.status = crate::job::JobStatus::Submitted;

        backend.mark_failed_jobs(vec![&mut job]);
        assert_eq!(job.status, crate::job::JobStatus::Submitted);
    }
}
