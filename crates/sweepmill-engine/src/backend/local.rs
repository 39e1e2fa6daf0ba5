//! The local process-pool backend.
//!
//! Jobs run as child processes on the host, pinned to CPUs with `taskset`.
//! The pool admits `available_cpus / cpus_per_job` jobs at a time; further
//! submissions wait for a slot. Run scripts append to their output files so
//! resumed jobs concatenate their logs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use anyhow::Result;
use rand::seq::index::sample;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::write_run_script;
use crate::constants::RETURN_CODE_FOR_RESUME;
use crate::error::EngineError;
use crate::job::ClusterJobId;
use crate::job::Job;
use crate::settings::EnvironmentSetup;
use crate::settings::Paths;

/// The cluster requirements understood by the local backend.
#[derive(Debug, Clone, Deserialize)]
struct LocalRequirements {
    /// CPUs allotted to each job.
    request_cpus: usize,
    /// Upper bound on the CPUs used by the pool.
    #[serde(default)]
    max_cpus: Option<usize>,
}

/// The exit record of a finished local job.
#[derive(Debug, Clone, Copy)]
struct Finished {
    /// The exit code of the job process.
    exit_code: i32,
}

/// The local process-pool backend.
#[derive(Debug)]
pub struct LocalBackend {
    /// CPUs allotted to each job.
    cpus_per_job: usize,
    /// The number of CPUs the pool may use.
    available_cpus: usize,
    /// Limits the number of concurrently running jobs.
    slots: Arc<Semaphore>,
    /// Exit records of finished jobs, by cluster id.
    finished: Arc<Mutex<HashMap<ClusterJobId, Finished>>>,
    /// Cancellation tokens of spawned jobs, by cluster id.
    cancel_tokens: HashMap<ClusterJobId, CancellationToken>,
    /// The next local cluster id to hand out.
    next_cluster_id: usize,
}

impl LocalBackend {
    /// Builds the backend from a requirements mapping.
    pub fn new(requirements: &serde_json::Value) -> Result<Self> {
        let req: LocalRequirements = serde_json::from_value(requirements.clone()).map_err(|e| {
            EngineError::Settings(format!(
                "cluster_requirements settings for local execution are invalid: {e}"
            ))
        })?;

        let host_cpus = sysinfo::System::new_all().cpus().len().max(1);
        let max_cpus = req.max_cpus.unwrap_or(host_cpus);
        if max_cpus == 0 {
            return Err(
                EngineError::Settings("CPU limit must be positive, not 0".to_string()).into(),
            );
        }
        if req.request_cpus == 0 {
            return Err(
                EngineError::Settings("request_cpus must be positive, not 0".to_string()).into(),
            );
        }

        let available_cpus = max_cpus.min(host_cpus);
        let mut concurrent_jobs = available_cpus / req.request_cpus;
        if concurrent_jobs == 0 {
            warn!(
                "total number of CPUs is smaller than requested CPUs per job; resorting to 1 CPU \
                 per job"
            );
            concurrent_jobs = available_cpus;
        }
        info!("local pool admits {concurrent_jobs} concurrent job(s)");

        Ok(Self {
            cpus_per_job: req.request_cpus.min(available_cpus),
            available_cpus,
            slots: Arc::new(Semaphore::new(concurrent_jobs)),
            finished: Arc::new(Mutex::new(HashMap::new())),
            cancel_tokens: HashMap::new(),
            next_cluster_id: 0,
        })
    }

    /// Hands out the next local cluster id.
    fn generate_cluster_id(&mut self) -> ClusterJobId {
        let cluster_id = ClusterJobId(format!("local-{id}", id = self.next_cluster_id));
        self.next_cluster_id += 1;
        cluster_id
    }

    /// Renders the local run script for a job.
    fn generate_run_script(&self, job: &mut Job, paths: &Paths, env: &EnvironmentSetup) -> Result<()> {
        let script_name = format!("{iteration}_{id}.sh", iteration = job.iteration, id = job.id);
        let run_script_file_path = paths.jobs_dir.join(&script_name);

        let cmd = job.generate_execution_cmd(paths, env, None)?;
        job.write_settings_files(paths)?;

        // Output files are opened in append mode so the output of resumed
        // jobs concatenates instead of overwriting earlier runs.
        let script = format!(
            r#"#!/bin/bash
# {id}

error="{run_script_file_path}.err"
output="{run_script_file_path}.out"

# Redirect output and error streams to files from here on
exec 1>>"$output"
exec 2>>"$error"

{cmd}
rc=$?

if [[ $rc != 0 && $rc != {resume} ]]; then
    echo "Failed with exit code $rc"
    # add an indicator file to more easily identify failed jobs
    echo "$rc" > "{run_script_file_path}.FAILED"
fi

exit $rc
"#,
            id = job.id,
            resume = RETURN_CODE_FOR_RESUME,
            run_script_file_path = run_script_file_path.display(),
        );

        debug!("generate run script for job {id}", id = job.id);
        write_run_script(&run_script_file_path, &script)?;
        job.run_script_path = Some(run_script_file_path);
        Ok(())
    }

    /// Spawns a job into the process pool.
    pub(super) async fn submit(
        &mut self,
        job: &mut Job,
        paths: &Paths,
        env: &EnvironmentSetup,
    ) -> Result<ClusterJobId> {
        // Only generate a run script for jobs that are submitted the first
        // time.
        if !job.waiting_for_resume {
            self.generate_run_script(job, paths, env)?;
        }
        let run_script = job
            .run_script_path
            .clone()
            .context("job has no run script")?;

        // Pin each job to a random CPU subset; slots keep the total load
        // bounded even though the subsets may overlap.
        let cpu_list = sample(&mut rand::rng(), self.available_cpus, self.cpus_per_job)
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let cluster_id = self.generate_cluster_id();
        let token = CancellationToken::new();
        self.cancel_tokens.insert(cluster_id.clone(), token.clone());

        let slots = self.slots.clone();
        let finished = self.finished.clone();
        let task_cluster_id = cluster_id.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                return;
            };

            let mut command = Command::new("taskset");
            command
                .arg("--cpu-list")
                .arg(&cpu_list)
                .arg("bash")
                .arg(&run_script)
                .kill_on_drop(true);

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    warn!("failed to spawn job {job_id}: {e}");
                    finished
                        .lock()
                        .expect("failed to lock finished map")
                        .insert(task_cluster_id, Finished { exit_code: 1 });
                    return;
                }
            };

            let exit_code = tokio::select! {
                _ = token.cancelled() => {
                    debug!("killing local job {job_id}");
                    let _ = child.kill().await;
                    return;
                }
                status = child.wait() => match status {
                    Ok(status) => status.code().unwrap_or(1),
                    Err(_) => 1,
                },
            };

            debug!("local job {job_id} exited with code {exit_code}");
            finished
                .lock()
                .expect("failed to lock finished map")
                .insert(task_cluster_id, Finished { exit_code });
        });

        Ok(cluster_id)
    }

    /// Cancels a spawned job.
    pub(super) async fn stop(&mut self, cluster_id: &ClusterJobId) {
        if let Some(token) = self.cancel_tokens.get(cluster_id) {
            token.cancel();
        }
    }

    /// Marks jobs whose process exited with a failing code.
    pub(super) fn mark_failed_jobs(&mut self, jobs: Vec<&mut Job>) {
        let finished = self.finished.lock().expect("failed to lock finished map");
        for job in jobs {
            let Some(cluster_id) = &job.cluster_id else {
                continue;
            };
            let Some(record) = finished.get(cluster_id) else {
                continue;
            };
            if record.exit_code == 0 || record.exit_code == RETURN_CODE_FOR_RESUME {
                continue;
            }

            let stderr = job
                .run_script_path
                .as_ref()
                .and_then(|p| {
                    let mut err = p.as_os_str().to_owned();
                    err.push(".err");
                    std::fs::read_to_string(err).ok()
                })
                .unwrap_or_else(|| {
                    format!(
                        "job process exited with code {code}",
                        code = record.exit_code
                    )
                });
            job.mark_failed(stderr);
        }
    }
}
