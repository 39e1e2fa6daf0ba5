//! Cluster backends and the submission bookkeeping built on top of them.
//!
//! A backend knows how to hand a [`Job`] to a batch system, how to cancel
//! it, and how to detect failures the communication server cannot observe
//! (e.g. a job that died before it could open its socket). The
//! [`ClusterInterface`] owns the jobs, the FIFO submission queue, and the
//! submission hooks, and delegates the batch-system specifics to one of the
//! three backends.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use colored::Colorize;
use indexmap::IndexMap;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::SUBMISSION_RETRIES;
use crate::error::EngineError;
use crate::hooks::HookState;
use crate::hooks::SubmissionHook;
use crate::job::ClusterJobId;
use crate::job::Job;
use crate::job::JobStatus;
use crate::settings::EnvironmentSetup;
use crate::settings::Paths;
use crate::utils::rm_dir_full;

mod condor;
mod local;
mod slurm;

pub use condor::CondorBackend;
pub use local::LocalBackend;
pub use slurm::SlurmBackend;

/// The kind of batch system jobs are submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// HTCondor.
    Condor,
    /// Slurm.
    Slurm,
    /// A pool of processes on the local machine.
    Local,
}

/// Detects which backend to use on this machine.
///
/// HTCondor wins over Slurm; with neither available, the local backend is
/// used after confirmation (or unconditionally when `run_local` is set).
pub fn detect_backend_kind(
    run_local: Option<bool>,
    no_user_interaction: bool,
) -> Result<BackendKind> {
    if run_local == Some(true) {
        info!("local execution requested, skipping cluster detection");
        return Ok(BackendKind::Local);
    }
    if which::which("condor_q").is_ok() {
        info!("CONDOR detected, running CONDOR job submission");
        return Ok(BackendKind::Condor);
    }
    if which::which("sbatch").is_ok() {
        info!("Slurm detected, running Slurm job submission");
        return Ok(BackendKind::Slurm);
    }

    let run_local = run_local.unwrap_or_else(|| {
        no_user_interaction
            || crate::utils::ask_yes_no("No cluster detected. Do you want to run locally?", true)
    });
    if run_local {
        info!("no cluster detected, running locally");
        Ok(BackendKind::Local)
    } else {
        anyhow::bail!("neither CONDOR nor Slurm was found and local execution was declined")
    }
}

/// A concrete batch-system adapter.
#[derive(Debug)]
pub enum Backend {
    /// The HTCondor backend.
    Condor(CondorBackend),
    /// The Slurm backend.
    Slurm(SlurmBackend),
    /// The local process-pool backend.
    Local(LocalBackend),
}

impl Backend {
    /// Constructs a backend of the given kind from its requirements mapping.
    pub fn new(kind: BackendKind, requirements: &serde_json::Value) -> Result<Self> {
        match kind {
            BackendKind::Condor => Ok(Self::Condor(CondorBackend::new(requirements)?)),
            BackendKind::Slurm => Ok(Self::Slurm(SlurmBackend::new(requirements)?)),
            BackendKind::Local => Ok(Self::Local(LocalBackend::new(requirements)?)),
        }
    }

    /// Gets the display name of the backend.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Condor(_) => "condor",
            Self::Slurm(_) => "slurm",
            Self::Local(_) => "local",
        }
    }

    /// Submits a job, returning the backend-assigned id.
    ///
    /// Renders the run script and job-spec file (unless the job is being
    /// resumed and already has them) and invokes the backend CLI with the
    /// shared retry budget.
    async fn submit(
        &mut self,
        job: &mut Job,
        paths: &Paths,
        env: &EnvironmentSetup,
    ) -> Result<ClusterJobId> {
        match self {
            Self::Condor(backend) => backend.submit(job, paths, env).await,
            Self::Slurm(backend) => backend.submit(job, paths, env).await,
            Self::Local(backend) => backend.submit(job, paths, env).await,
        }
    }

    /// Cancels a submitted job.
    pub async fn stop(&mut self, cluster_id: &ClusterJobId) {
        match self {
            Self::Condor(backend) => backend.stop(cluster_id).await,
            Self::Slurm(backend) => backend.stop(cluster_id).await,
            Self::Local(backend) => backend.stop(cluster_id).await,
        }
    }

    /// Determines if the backend re-queues resumed jobs on its own.
    ///
    /// HTCondor holds and periodically releases jobs that exit with the
    /// resume code, so the orchestrator must not re-enqueue them.
    fn handles_resume(&self) -> bool {
        matches!(self, Self::Condor(_))
    }

    /// Determines if enough time has passed for another failure poll.
    fn is_ready_to_check_for_failed_jobs(&self) -> bool {
        match self {
            Self::Condor(_) | Self::Local(_) => true,
            Self::Slurm(backend) => backend.is_ready_to_check_for_failed_jobs(),
        }
    }

    /// Checks the given jobs against the batch system and marks failures.
    async fn mark_failed_jobs(&mut self, jobs: Vec<&mut Job>) -> Result<()> {
        match self {
            Self::Condor(backend) => {
                backend.mark_failed_jobs(jobs);
                Ok(())
            }
            Self::Slurm(backend) => backend.mark_failed_jobs(jobs).await,
            Self::Local(backend) => {
                backend.mark_failed_jobs(jobs);
                Ok(())
            }
        }
    }
}

/// Runs a submission command with the shared retry budget.
///
/// Each attempt is bounded by `timeout`; timeouts and non-zero exits are
/// retried up to the attempt budget. Returns the stdout of the first
/// successful attempt.
async fn run_submit_command(
    command: &mut Command,
    job_id: usize,
    timeout: Duration,
) -> Result<String> {
    for _ in 0..SUBMISSION_RETRIES {
        let attempt = async {
            let output = command.output().await?;
            anyhow::Ok(output)
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(output)) if output.status.success() => {
                return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
            }
            Ok(Ok(output)) => {
                warn!(
                    "job submission for id {job_id} failed with {status}; retrying",
                    status = output.status
                );
            }
            Ok(Err(e)) => {
                warn!("job submission for id {job_id} could not be spawned: {e}; retrying");
            }
            Err(_) => {
                warn!("job submission for id {job_id} hangs; retrying");
            }
        }
    }

    Err(EngineError::Submission(
        "too many submission failures, cluster seems to be too unstable to submit jobs".to_string(),
    )
    .into())
}

/// Writes a run script to disk and makes it executable.
fn write_run_script(path: &std::path::Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .with_context(|| format!("failed to write `{path}`", path = path.display()))?;

    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(path, Permissions::from_mode(0o755))
            .with_context(|| format!("failed to chmod `{path}`", path = path.display()))?;
    }

    Ok(())
}

/// Owns the jobs of a run and their path through the batch system.
#[derive(Debug)]
pub struct ClusterInterface {
    /// All jobs registered with the interface.
    jobs: Vec<Job>,
    /// Ids of jobs waiting to be handed to the backend, in FIFO order.
    submission_queue: VecDeque<usize>,
    /// The batch-system adapter.
    backend: Backend,
    /// The directories of the run.
    paths: Paths,
    /// The environment preparation for job commands.
    env: EnvironmentSetup,
    /// Whether the job scripts directory is removed on close.
    remove_jobs_dir: bool,
    /// The registered submission hooks, by identifier.
    hooks: IndexMap<String, Box<dyn SubmissionHook>>,
    /// Error texts that were already reported to the user.
    error_msgs: HashSet<String>,
    /// The next job id to hand out.
    next_job_id: usize,
}

impl ClusterInterface {
    /// Constructs a new interface over the given backend.
    pub fn new(backend: Backend, paths: Paths, env: EnvironmentSetup, remove_jobs_dir: bool) -> Self {
        Self {
            jobs: Vec::new(),
            submission_queue: VecDeque::new(),
            backend,
            paths,
            env,
            remove_jobs_dir,
            hooks: IndexMap::new(),
            error_msgs: HashSet::new(),
            next_job_id: 0,
        }
    }

    /// Hands out the next job id.
    pub fn inc_job_id(&mut self) -> usize {
        let id = self.next_job_id;
        self.next_job_id += 1;
        id
    }

    /// The directories of the run.
    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    /// Registers a submission hook.
    ///
    /// Hooks that report an errored state are skipped with a warning.
    pub fn register_submission_hook(&mut self, hook: Box<dyn SubmissionHook>) {
        if hook.state() == HookState::Errored {
            warn!(
                "submission hook {id} reported errors and is skipped",
                id = hook.identifier()
            );
            return;
        }
        info!("register submission hook {id}", id = hook.identifier());
        self.hooks.insert(hook.identifier().to_string(), hook);
    }

    /// Unregisters a submission hook by identifier.
    pub fn unregister_submission_hook(&mut self, identifier: &str) -> Result<()> {
        if self.hooks.shift_remove(identifier).is_none() {
            return Err(EngineError::HookNotFound(identifier.to_string()).into());
        }
        info!("unregister submission hook {identifier}");
        Ok(())
    }

    /// Runs the pre-run routine of every hook.
    pub fn exec_pre_run_routines(&mut self) {
        for hook in self.hooks.values_mut() {
            if let Err(e) = hook.pre_run_routine() {
                warn!("pre-run routine of hook {id} failed: {e:#}", id = hook.identifier());
            }
        }
    }

    /// Runs the post-run routine of every hook.
    pub fn exec_post_run_routines(&mut self) {
        for hook in self.hooks.values_mut() {
            if let Err(e) = hook.post_run_routine() {
                warn!("post-run routine of hook {id} failed: {e:#}", id = hook.identifier());
            }
        }
    }

    /// Collects the current status of every hook.
    pub fn collect_stats_from_hooks(&self) -> IndexMap<String, Option<String>> {
        self.hooks
            .iter()
            .map(|(id, hook)| (id.clone(), hook.status()))
            .collect()
    }

    /// Registers new jobs, optionally enqueueing them for submission.
    pub fn add_jobs(&mut self, jobs: Vec<Job>, enqueue: bool) {
        if enqueue {
            self.submission_queue.extend(jobs.iter().map(|j| j.id));
        }
        self.jobs.extend(jobs);
    }

    /// Adds a job to the submission queue.
    pub fn enqueue_job_for_submission(&mut self, job_id: usize) {
        self.submission_queue.push_back(job_id);
    }

    /// Drops queued jobs that no longer need to run.
    ///
    /// Used after results were loaded from the filesystem, where jobs are
    /// concluded without ever being submitted.
    pub fn prune_submission_queue(&mut self) {
        let jobs = &self.jobs;
        self.submission_queue.retain(|id| {
            jobs.iter()
                .find(|j| j.id == *id)
                .is_none_or(|j| j.status == JobStatus::Initial)
        });
    }

    /// Determines if jobs are waiting in the submission queue.
    pub fn has_unsubmitted_jobs(&self) -> bool {
        !self.submission_queue.is_empty()
    }

    /// Looks up a job by id.
    pub fn get_job(&self, job_id: usize) -> Option<&Job> {
        self.jobs.iter().find(|j| j.id == job_id)
    }

    /// Looks up a job by id, mutably.
    pub fn get_job_mut(&mut self, job_id: usize) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|j| j.id == job_id)
    }

    /// Submits the next job from the submission queue.
    ///
    /// On a submission error the interface is closed before the error is
    /// returned, so no jobs are left behind on the cluster.
    pub async fn submit_next(&mut self) -> Result<()> {
        debug!("submit next job from queue");
        let job_id = self
            .submission_queue
            .pop_front()
            .context("no job to submit, queue is empty")?;
        self.submit(job_id).await
    }

    /// Submits the given job to the backend.
    async fn submit(&mut self, job_id: usize) -> Result<()> {
        let result = {
            let Self {
                jobs,
                backend,
                paths,
                env,
                ..
            } = &mut *self;
            let job = jobs
                .iter_mut()
                .find(|j| j.id == job_id)
                .with_context(|| format!("job {job_id} is not registered"))?;

            if job.cluster_id.is_some() && !job.waiting_for_resume {
                anyhow::bail!("can not run a job that already ran");
            }

            backend.submit(job, paths, env).await.map(|cluster_id| {
                if job.waiting_for_resume {
                    info!(
                        "job with id {id} re-submitted with cluster id {cluster_id}",
                        id = job.id
                    );
                } else {
                    info!(
                        "job with id {id} submitted with cluster id {cluster_id}",
                        id = job.id
                    );
                }
                job.cluster_id = Some(cluster_id);
                job.status = JobStatus::Submitted;
            })
        };

        if let Err(e) = result {
            // Best-effort sweep so that nothing keeps running when the run
            // aborts with a submission error.
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    /// Marks a job as due for resume and arranges its re-submission.
    ///
    /// The job keeps its id but will get a fresh cluster id; on backends
    /// where the scheduler re-queues held jobs itself nothing is enqueued.
    pub fn resume(&mut self, job_id: usize) {
        let handles_resume = self.backend.handles_resume();
        let Some(job) = self.get_job_mut(job_id) else {
            warn!("received a resume request for unknown job {job_id}");
            return;
        };
        info!("job {job_id} exited to be resumed");
        job.waiting_for_resume = true;
        job.status = JobStatus::Submitted;
        if !handles_resume {
            self.enqueue_job_for_submission(job_id);
        }
    }

    /// Cancels a single job on the backend.
    pub async fn stop(&mut self, job_id: usize) -> Result<()> {
        let cluster_id = self
            .get_job(job_id)
            .and_then(|j| j.cluster_id.clone())
            .context("can not stop a job unless its cluster id is known")?;
        self.backend.stop(&cluster_id).await;
        Ok(())
    }

    /// Cancels every job that may still be running on the backend.
    pub async fn stop_all(&mut self) {
        println!("Killing remaining jobs...");
        let to_stop: Vec<ClusterJobId> = self
            .jobs
            .iter()
            .filter(|job| {
                matches!(
                    job.status,
                    JobStatus::Submitted | JobStatus::Running | JobStatus::SentResults
                )
            })
            .filter_map(|job| job.cluster_id.clone())
            .collect();
        for cluster_id in to_stop {
            self.backend.stop(&cluster_id).await;
        }
    }

    /// Stops everything and cleans up the job scripts directory.
    pub async fn close(&mut self) {
        self.stop_all().await;

        if self.remove_jobs_dir {
            info!(
                "removing jobs directory {dir}",
                dir = self.paths.jobs_dir.display()
            );
            rm_dir_full(&self.paths.jobs_dir).await;
        } else {
            println!(
                "Output/logs of individual jobs are kept in {}",
                self.paths.jobs_dir.display().to_string().blue()
            );
        }

        println!(
            "Results are stored in {}",
            self.paths.result_dir.display().to_string().blue()
        );
    }

    /// Determines if the backend wants to be polled for failures.
    pub fn is_ready_to_check_for_failed_jobs(&self) -> bool {
        self.backend.is_ready_to_check_for_failed_jobs()
    }

    /// Polls the backend for failed jobs.
    ///
    /// Jobs that are submitted but have not reported anything (or that wait
    /// for a resume) are checked; newly observed error texts are returned
    /// exactly once for display.
    pub async fn check_for_failed_jobs(&mut self) -> Result<Vec<String>> {
        let Self { jobs, backend, .. } = self;
        let to_check: Vec<&mut Job> = jobs
            .iter_mut()
            .filter(|job| {
                job.cluster_id.is_some()
                    && (job.status == JobStatus::Submitted || job.waiting_for_resume)
            })
            .collect();
        if !to_check.is_empty() {
            backend.mark_failed_jobs(to_check).await?;
        }

        Ok(self.collect_new_error_msgs())
    }

    /// Collects error texts of failed jobs that were not reported before.
    fn collect_new_error_msgs(&mut self) -> Vec<String> {
        let mut new_msgs = Vec::new();
        for job in self.jobs.iter().filter(|j| j.status == JobStatus::Failed) {
            let Some(error_info) = &job.error_info else {
                continue;
            };
            if self.error_msgs.contains(error_info) {
                continue;
            }
            self.error_msgs.insert(error_info.clone());
            let header = format!(
                "Job {id} on hostname {hostname} failed with error:",
                id = job.id,
                hostname = job.hostname.as_deref().unwrap_or("<unknown>")
            );
            let full_warning = format!("{} \n{error_info}", header.red().bold());
            warn!("{full_warning}");
            new_msgs.push(full_warning);
        }
        new_msgs
    }

    /// All registered jobs.
    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    /// Successful jobs whose results were not yet fed to the optimizer.
    pub fn jobs_to_tell(&mut self) -> Vec<&mut Job> {
        self.jobs
            .iter_mut()
            .filter(|j| {
                j.status == JobStatus::Concluded && j.has_results() && !j.results_used_for_update
            })
            .collect()
    }

    /// Jobs that have been handed to the backend at least once.
    pub fn submitted_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| j.cluster_id.is_some())
    }

    /// The number of submitted jobs.
    pub fn n_submitted_jobs(&self) -> usize {
        self.submitted_jobs().count()
    }

    /// Jobs currently reported as running.
    pub fn running_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().filter(|j| j.status == JobStatus::Running)
    }

    /// The number of running jobs.
    pub fn n_running_jobs(&self) -> usize {
        self.running_jobs().count()
    }

    /// Jobs that reached a terminal state.
    pub fn completed_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Concluded | JobStatus::Failed))
    }

    /// The number of completed jobs.
    pub fn n_completed_jobs(&self) -> usize {
        self.completed_jobs().count()
    }

    /// Jobs that concluded with a usable result row.
    pub fn successful_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs
            .iter()
            .filter(|j| j.status == JobStatus::Concluded && j.has_results())
    }

    /// Ids of jobs that concluded with a usable result row.
    pub fn successful_job_ids(&self) -> Vec<usize> {
        self.successful_jobs().map(|j| j.id).collect()
    }

    /// The number of successful jobs.
    pub fn n_successful_jobs(&self) -> usize {
        self.successful_jobs().count()
    }

    /// Completed jobs without a usable result.
    ///
    /// Includes jobs that concluded without results once their grace window
    /// has decided against them.
    pub fn failed_jobs(&self) -> impl Iterator<Item = &Job> {
        self.completed_jobs()
            .filter(|j| j.status == JobStatus::Failed || !j.has_results())
    }

    /// The number of failed jobs.
    pub fn n_failed_jobs(&self) -> usize {
        self.failed_jobs().count()
    }

    /// Jobs waiting to start.
    pub fn idle_jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Initial | JobStatus::Submitted))
    }

    /// The number of idle jobs.
    pub fn n_idle_jobs(&self) -> usize {
        self.idle_jobs().count()
    }

    /// The total number of registered jobs.
    pub fn n_total_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// The median estimated time left across running jobs, formatted.
    ///
    /// Empty when no running job has reported an estimate.
    pub fn median_time_left(&self) -> String {
        let mut times: Vec<Duration> = self.running_jobs().filter_map(Job::time_left).collect();
        if times.is_empty() {
            return String::new();
        }
        times.sort();
        Job::time_left_to_str(times[times.len() / 2])
    }

    /// The best last early-reported metric value among running jobs.
    pub fn get_best_seen_value_of_main_metric(&self, minimize: bool) -> Option<f64> {
        let latest = self
            .running_jobs()
            .filter_map(|j| j.reported_metric_values.last().copied());
        if minimize {
            latest.min_by(f64::total_cmp)
        } else {
            latest.max_by(f64::total_cmp)
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hooks::test::RecordingHook;
    use crate::params::ParamTree;
    use std::path::PathBuf;

    /// Builds an interface over the local backend in a temp directory.
    fn test_interface(root: &std::path::Path) -> ClusterInterface {
        let paths = Paths {
            main_path: root.join("project"),
            script_to_run: PathBuf::from("main.sh"),
            result_dir: root.join("results"),
            jobs_dir: root.join("jobs"),
            current_result_dir: root.join("results/working_directories"),
        };
        let backend = Backend::new(
            BackendKind::Local,
            &serde_json::json!({"request_cpus": 1}),
        )
        .expect("should build backend");
        ClusterInterface::new(backend, paths, EnvironmentSetup::default(), true)
    }

    /// Builds a job for the given interface.
    fn make_job(interface: &mut ClusterInterface, iteration: usize) -> Job {
        let id = interface.inc_job_id();
        Job::new(
            id,
            ParamTree::new(),
            ParamTree::new(),
            iteration,
            "127.0.0.1:1".parse().unwrap(),
            None,
            "test".to_string(),
        )
    }

    #[tokio::test]
    async fn submission_succeeds_on_last_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("attempts");
        std::fs::write(&counter, "0").unwrap();

        // Fails on every attempt except the last one of the retry budget.
        let script = format!(
            "n=$(cat {counter}); n=$((n + 1)); echo $n > {counter}; \
             if [ $n -lt {retries} ]; then exit 1; fi; echo 'Submitted batch job 42'",
            counter = counter.display(),
            retries = SUBMISSION_RETRIES,
        );
        let mut command = Command::new("bash");
        command.arg("-c").arg(&script);

        let stdout = run_submit_command(&mut command, 0, Duration::from_secs(30))
            .await
            .expect("the final attempt should succeed");
        assert!(stdout.contains("Submitted batch job 42"));
        assert_eq!(
            std::fs::read_to_string(&counter).unwrap().trim(),
            SUBMISSION_RETRIES.to_string()
        );
    }

    #[tokio::test]
    async fn submission_fails_after_retry_budget() {
        let mut command = Command::new("bash");
        command.arg("-c").arg("exit 1");

        let error = run_submit_command(&mut command, 0, Duration::from_secs(30))
            .await
            .expect_err("all attempts should fail");
        assert!(error.to_string().contains("too many submission failures"));
    }

    #[tokio::test]
    async fn queue_is_fifo_and_counts_are_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let mut interface = test_interface(dir.path());

        let jobs: Vec<Job> = (0..3).map(|_| make_job(&mut interface, 1)).collect();
        interface.add_jobs(jobs, true);

        assert!(interface.has_unsubmitted_jobs());
        assert_eq!(interface.n_total_jobs(), 3);
        assert_eq!(interface.n_idle_jobs(), 3);
        assert_eq!(interface.n_submitted_jobs(), 0);
        assert_eq!(
            interface.submission_queue.iter().copied().collect::<Vec<_>>(),
            [0, 1, 2]
        );

        // All status counts always partition the job list.
        let sum = interface.n_idle_jobs()
            + interface.n_running_jobs()
            + interface.n_completed_jobs();
        assert_eq!(sum, interface.n_total_jobs());
    }

    #[tokio::test]
    async fn pruning_drops_concluded_jobs_from_the_queue() {
        let dir = tempfile::tempdir().unwrap();
        let mut interface = test_interface(dir.path());

        let jobs: Vec<Job> = (0..3).map(|_| make_job(&mut interface, 1)).collect();
        interface.add_jobs(jobs, true);
        interface.get_job_mut(1).unwrap().status = JobStatus::Concluded;

        interface.prune_submission_queue();
        assert_eq!(
            interface.submission_queue.iter().copied().collect::<Vec<_>>(),
            [0, 2]
        );
    }

    #[tokio::test]
    async fn resume_requeues_and_flags_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut interface = test_interface(dir.path());
        let mut job = make_job(&mut interface, 1);
        job.status = JobStatus::Running;
        job.cluster_id = Some(ClusterJobId("local-0".to_string()));
        interface.add_jobs(vec![job], false);

        interface.resume(0);

        let job = interface.get_job(0).unwrap();
        assert!(job.waiting_for_resume);
        assert_eq!(job.status, JobStatus::Submitted);
        assert!(interface.has_unsubmitted_jobs());
    }

    #[tokio::test]
    async fn errored_hooks_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut interface = test_interface(dir.path());

        interface.register_submission_hook(Box::new(RecordingHook {
            errored: true,
            ..Default::default()
        }));
        assert!(interface.hooks.is_empty());

        interface.register_submission_hook(Box::new(RecordingHook::default()));
        assert_eq!(interface.hooks.len(), 1);

        interface.exec_pre_run_routines();
        interface.exec_post_run_routines();
        let stats = interface.collect_stats_from_hooks();
        assert_eq!(stats["recording"], Some("1 updates".to_string()));

        assert!(interface.unregister_submission_hook("recording").is_ok());
        assert!(interface.unregister_submission_hook("recording").is_err());
    }

    #[tokio::test]
    async fn error_messages_are_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut interface = test_interface(dir.path());
        let mut job = make_job(&mut interface, 1);
        job.mark_failed("something broke");
        interface.add_jobs(vec![job], false);

        let first = interface.collect_new_error_msgs();
        assert_eq!(first.len(), 1);
        assert!(first[0].contains("something broke"));

        let second = interface.collect_new_error_msgs();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn best_seen_metric_uses_latest_reports() {
        let dir = tempfile::tempdir().unwrap();
        let mut interface = test_interface(dir.path());

        let mut a = make_job(&mut interface, 1);
        a.status = JobStatus::Running;
        a.reported_metric_values = vec![5.0, 3.0];
        let mut b = make_job(&mut interface, 1);
        b.status = JobStatus::Running;
        b.reported_metric_values = vec![4.0];
        let c = make_job(&mut interface, 1);
        interface.add_jobs(vec![a, b, c], false);

        assert_eq!(interface.get_best_seen_value_of_main_metric(true), Some(3.0));
        assert_eq!(interface.get_best_seen_value_of_main_metric(false), Some(4.0));
        assert_eq!(interface.median_time_left(), "");
    }
}
