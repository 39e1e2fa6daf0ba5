//! The orchestration engine.
//!
//! Two entry points share one control loop: [`hp_optimization`] runs an
//! iterative search driven by an optimizer, [`grid_search`] enumerates a
//! fixed parameter grid. The loop is a select over the tick timer, the
//! communication-server event channel, the interrupt signal, and the
//! console; all job state is mutated here and nowhere else.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use chrono::Local;
use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::backend::Backend;
use crate::backend::ClusterInterface;
use crate::backend::detect_backend_kind;
use crate::comms::CommunicationServer;
use crate::comms::Event;
use crate::comms::Message;
use crate::console::Console;
use crate::console::ConsoleEvent;
use crate::console::run_command_shell;
use crate::constants::CONCLUDED_WITHOUT_RESULTS_GRACE_TIME;
use crate::constants::JOB_MANAGER_LOOP_SLEEP_TIME;
use crate::error::EngineError;
use crate::hooks::SubmissionHook;
use crate::job::Job;
use crate::job::JobStatus;
use crate::optimizer::GridSearchOptimizer;
use crate::optimizer::Optimizer;
use crate::optimizer::initialize_optimizer;
use crate::params::ParamValue;
use crate::progress::ProgressBars;
use crate::results::Table;
use crate::settings::EarlyKillingParams;
use crate::settings::GenerateReport;
use crate::settings::Paths;
use crate::settings::Settings;
use crate::utils::RunType;
use crate::utils::rm_dir_full;
use crate::utils::save_metadata;
use crate::utils::save_report_data;

/// How many queued jobs a grid search submits per tick.
const GRID_SUBMISSIONS_PER_TICK: usize = 5;

/// The slack added to the failure budget.
///
/// A run aborts once more jobs failed than succeeded or are running, plus
/// this slack.
const FAILURE_BUDGET_SLACK: usize = 5;

/// How an orchestration run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The run completed its sample budget.
    Completed,
    /// The run was interrupted by the user.
    Interrupted,
}

/// The result of a grid search.
#[derive(Debug)]
pub enum GridOutcome {
    /// The grid was fully evaluated.
    Completed {
        /// One row per job that produced results.
        results: Table,
        /// The status collected from the submission hooks.
        hook_stats: IndexMap<String, Option<String>>,
    },
    /// The run was interrupted by the user.
    Interrupted,
}

/// Applies communication-server events to job state.
///
/// Owns the grace timers of jobs that concluded without results.
struct EventHandler {
    /// For sending grace-expiry events back into the orchestrator channel.
    sender: mpsc::Sender<Event>,
    /// Armed grace timers, by job id.
    grace_timers: HashMap<usize, CancellationToken>,
}

impl EventHandler {
    /// Constructs a handler sending timer events into the given channel.
    fn new(sender: mpsc::Sender<Event>) -> Self {
        Self {
            sender,
            grace_timers: HashMap::new(),
        }
    }

    /// Applies a single event to the job it addresses.
    ///
    /// Events for unknown jobs are logged and dropped.
    fn apply(&mut self, interface: &mut ClusterInterface, event: Event) {
        match event {
            Event::Message(Message::JobStarted { job_id, hostname }) => {
                info!("job {job_id} started on hostname {hostname}");
                let Some(job) = interface.get_job_mut(job_id) else {
                    warn!("received a start message from unknown job {job_id}");
                    return;
                };
                job.status = JobStatus::Running;
                job.hostname = Some(hostname);
                if !job.waiting_for_resume {
                    job.start_time = Some(Instant::now());
                }
                job.waiting_for_resume = false;
            }
            Event::Message(Message::ErrorEncountered { job_id, lines }) => {
                warn!(
                    "job {job_id} died with error {last:?}",
                    last = lines.last().map(String::as_str).unwrap_or_default()
                );
                let Some(job) = interface.get_job_mut(job_id) else {
                    warn!("received an error message from unknown job {job_id}");
                    return;
                };
                job.mark_failed(lines.join(""));
            }
            Event::Message(Message::JobSentResults { job_id, metrics }) => {
                let Some(job) = interface.get_job_mut(job_id) else {
                    warn!("received a results message from unknown job {job_id}");
                    return;
                };
                if job.status == JobStatus::ConcludedWithoutResults {
                    job.status = JobStatus::Concluded;
                    info!("job {job_id} now sent results after concluding earlier");
                } else {
                    job.status = JobStatus::SentResults;
                    info!("job {job_id} sent results");
                }
                // Metrics are set exactly once; a repeated message cannot
                // change them.
                if job.metrics.is_none() {
                    job.metrics = Some(metrics);
                }
                if let Err(e) = job.set_results() {
                    warn!("job {job_id} sent metrics but something went wrong: {e:#}");
                }
                if let Some(token) = self.grace_timers.remove(&job_id) {
                    token.cancel();
                }
            }
            Event::Message(Message::JobConcluded { job_id }) => {
                let Some(job) = interface.get_job_mut(job_id) else {
                    warn!("received a conclude message from unknown job {job_id}");
                    return;
                };
                if job.status == JobStatus::SentResults && job.has_results() {
                    job.status = JobStatus::Concluded;
                    info!("job {job_id} finished successfully");
                } else {
                    // The conclude message may overtake the results message.
                    // Park the job in an intermediate state and give the
                    // results a grace window before considering it failed.
                    job.status = JobStatus::ConcludedWithoutResults;
                    info!("job {job_id} announced its end but no results were sent so far");
                    self.arm_grace_timer(job_id);
                }
            }
            Event::Message(Message::ExitForResume { job_id }) => {
                interface.resume(job_id);
            }
            Event::Message(Message::JobProgress { job_id, fraction }) => {
                info!(
                    "job {job_id} announced it is {percent}% done",
                    percent = (100.0 * fraction) as u32
                );
                let Some(job) = interface.get_job_mut(job_id) else {
                    warn!("received a progress message from unknown job {job_id}");
                    return;
                };
                if fraction > 0.0 && fraction <= 1.0 {
                    if let Some(start) = job.start_time {
                        job.estimated_end = Some(start + start.elapsed().div_f64(fraction));
                    }
                }
            }
            Event::Message(Message::MetricEarlyReport { job_id, metrics }) => {
                debug!("job {job_id} sent intermediate results");
                let Some(job) = interface.get_job_mut(job_id) else {
                    warn!("received an early report from unknown job {job_id}");
                    return;
                };
                if job.status != JobStatus::Running {
                    return;
                }
                if let Some(metric) = &job.metric_to_watch {
                    if let Some(value) = metrics.get(metric) {
                        info!("job {job_id} currently has {metric}={value}");
                        job.reported_metric_values.push(*value);
                    }
                }
            }
            Event::GraceExpired { job_id } => {
                self.grace_timers.remove(&job_id);
                let Some(job) = interface.get_job_mut(job_id) else {
                    return;
                };
                if job.status == JobStatus::ConcludedWithoutResults {
                    info!(
                        "job {job_id} has concluded, but has not sent results after \
                         {secs} seconds; considering job failed",
                        secs = CONCLUDED_WITHOUT_RESULTS_GRACE_TIME.as_secs()
                    );
                    job.mark_failed("Job concluded but sent no results.");
                }
            }
        }
    }

    /// Arms the one-shot grace timer for a job.
    ///
    /// The timer is cancelled when results arrive; it fires at most once
    /// per arming.
    fn arm_grace_timer(&mut self, job_id: usize) {
        let token = CancellationToken::new();
        self.grace_timers.insert(job_id, token.clone());

        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(CONCLUDED_WITHOUT_RESULTS_GRACE_TIME) => {
                    let _ = sender.send(Event::GraceExpired { job_id }).await;
                }
            }
        });
    }
}

/// Computes the submission ceiling for the current iteration.
///
/// Beyond the iteration's base budget, a fresh batch of
/// `n_completed_jobs_before_resubmit` submissions is unlocked for every
/// batch of that many completions.
fn max_submissions_in_iteration(
    n_completed_in_iter: usize,
    n_completed_jobs_before_resubmit: usize,
    n_jobs_per_iteration: usize,
) -> usize {
    (n_completed_in_iter / n_completed_jobs_before_resubmit) * n_completed_jobs_before_resubmit
        + n_jobs_per_iteration
}

/// Ranks the values ascending; equal values keep their input order.
fn ranks(values: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));
    let mut result = vec![0; values.len()];
    for (rank, index) in order.into_iter().enumerate() {
        result[index] = rank;
    }
    result
}

/// Kills running jobs whose intermediate metrics rank hopelessly.
///
/// Builds the matrix of intermediate metric histories of completed jobs,
/// computes how much ranks at each timestep deviate from the final
/// ranking, and cancels running jobs whose current rank exceeds the target
/// rank by more than the allowed number of deviations. A killed job keeps
/// its last reported value as its final metric so the optimizer still
/// learns from it.
async fn kill_bad_looking_jobs(
    interface: &mut ClusterInterface,
    metric_to_optimize: &str,
    minimize: bool,
    params: &EarlyKillingParams,
) -> Result<()> {
    let sign = if minimize { 1.0 } else { -1.0 };

    // One row per completed job: its early reports plus its final value.
    let mut histories: Vec<Vec<f64>> = interface
        .successful_jobs()
        .filter(|job| !job.reported_metric_values.is_empty())
        .filter_map(|job| {
            let final_value = *job.metrics.as_ref()?.get(metric_to_optimize)?;
            let mut history = job.reported_metric_values.clone();
            history.push(final_value);
            Some(history)
        })
        .collect();
    if histories.is_empty() {
        return Ok(());
    }
    let max_len = histories.iter().map(Vec::len).max().unwrap_or(0);
    histories.retain(|h| h.len() == max_len);
    if histories.len() < 5 {
        return Ok(());
    }

    // Per-job rank at each timestep, and how much ranks at timestep t
    // deviate from the final ranking.
    let rank_matrix: Vec<Vec<usize>> = (0..max_len)
        .map(|t| {
            let column: Vec<f64> = histories.iter().map(|h| h[t] * sign).collect();
            ranks(&column)
        })
        .collect();
    let final_ranks = &rank_matrix[max_len - 1];
    let rank_deviations: Vec<f64> = rank_matrix
        .iter()
        .map(|column| {
            let sum_sq: f64 = column
                .iter()
                .zip(final_ranks)
                .map(|(r, f)| (*r as f64 - *f as f64).powi(2))
                .sum();
            (sum_sq / column.len() as f64).sqrt()
        })
        .collect();

    let candidates: Vec<(usize, usize, f64)> = interface
        .running_jobs()
        .filter(|job| !job.reported_metric_values.is_empty())
        // A job past half of the expected runtime is left alone.
        .filter(|job| job.reported_metric_values.len() <= max_len / 2)
        .map(|job| {
            let index = job.reported_metric_values.len() - 1;
            let value = *job
                .reported_metric_values
                .last()
                .expect("job has at least one report");
            (job.id, index, value)
        })
        .collect();

    for (job_id, index, value) in candidates {
        let mut all_values: Vec<f64> = histories.iter().map(|h| h[index] * sign).collect();
        all_values.push(value * sign);
        let rank_of_current = *ranks(&all_values)
            .last()
            .expect("the candidate was just pushed");

        if rank_of_current as f64 - params.how_many_stds * rank_deviations[index]
            > params.target_rank
        {
            info!("killing job {job_id}: intermediate rank {rank_of_current} is hopeless");
            {
                let job = interface
                    .get_job_mut(job_id)
                    .expect("candidate job exists");
                job.metrics = Some(
                    [(metric_to_optimize.to_string(), value)]
                        .into_iter()
                        .collect(),
                );
                job.status = JobStatus::Concluded;
                job.set_results()?;
            }
            interface.stop(job_id).await?;
        }
    }
    Ok(())
}

/// Sets up the shared run infrastructure.
///
/// Creates the run directories, selects and builds the backend, registers
/// hooks, and binds the communication server.
async fn pre_opt(
    settings: &Settings,
    paths: Paths,
    hooks: Vec<Box<dyn SubmissionHook>>,
) -> Result<(ClusterInterface, CommunicationServer, mpsc::Receiver<Event>)> {
    std::fs::create_dir_all(&paths.result_dir).with_context(|| {
        format!(
            "failed to create results directory `{path}`",
            path = paths.result_dir.display()
        )
    })?;
    std::fs::create_dir_all(&paths.current_result_dir)?;
    std::fs::create_dir_all(&paths.jobs_dir)?;
    info!(
        "creating directory {path}",
        path = paths.current_result_dir.display()
    );
    info!(
        "logs of individual jobs stored at {path}",
        path = paths.jobs_dir.display()
    );
    info!("using project directory {path}", path = paths.main_path.display());

    let kind = detect_backend_kind(settings.run_local, settings.no_user_interaction)?;
    let backend = Backend::new(kind, &settings.cluster_requirements)?;
    info!("submitting jobs via the {name} backend", name = backend.name());
    let mut interface = ClusterInterface::new(
        backend,
        paths,
        settings.environment_setup.clone(),
        settings.remove_jobs_dir,
    );
    for hook in hooks {
        interface.register_submission_hook(hook);
    }
    interface.exec_pre_run_routines();

    let (server, events) = CommunicationServer::bind().await?;
    Ok((interface, server, events))
}

/// Tears down the run infrastructure.
async fn post_opt(interface: &mut ClusterInterface) {
    interface.exec_post_run_routines();
    interface.close().await;
    println!("Procedure successfully finished");
}

/// Copies the working directories of the best jobs into `best_jobs/`.
///
/// Outdated entries from earlier iterations are removed so the directory
/// always mirrors the current best set.
async fn update_best_job_datadirs(
    result_dir: &std::path::Path,
    working_dirs: &[std::path::PathBuf],
    remove_working_dirs: bool,
) -> Result<()> {
    let datadir = result_dir.join("best_jobs");
    std::fs::create_dir_all(&datadir)?;

    let short_names: Vec<String> = working_dirs
        .iter()
        .filter_map(|dir| dir.file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .collect();

    // Copy over new best directories.
    for working_dir in working_dirs {
        if !working_dir.exists() {
            continue;
        }
        let Some(name) = working_dir.file_name() else {
            continue;
        };
        let target = datadir.join(name);
        if !target.exists() {
            std::fs::create_dir_all(&target)?;
            let options = fs_extra::dir::CopyOptions::new().content_only(true);
            fs_extra::dir::copy(working_dir, &target, &options)
                .map_err(|e| anyhow::anyhow!("failed to copy best job data: {e}"))?;
        }
        if remove_working_dirs {
            rm_dir_full(working_dir).await;
        }
    }

    // Delete best directories that dropped out of the best set.
    for entry in std::fs::read_dir(&datadir)? {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        if !short_names.contains(&entry.file_name().to_string_lossy().into_owned()) {
            rm_dir_full(&entry.path()).await;
        }
    }

    info!("best jobs in directory {path} updated", path = datadir.display());
    Ok(())
}

/// Closes an optimizer iteration.
///
/// Tells the optimizer about any remaining results, persists the tables
/// and snapshot, updates the preserved best-job directories, and removes
/// finished working directories when configured to.
async fn post_iteration_opt(
    interface: &mut ClusterInterface,
    optimizer: &mut Box<dyn Optimizer>,
    bars: &ProgressBars,
    num_best_jobs_whose_data_is_kept: usize,
    remove_working_dirs: bool,
    generate_report: bool,
) -> Result<()> {
    let hook_stats = interface.collect_stats_from_hooks();

    let jobs_to_tell = interface.jobs_to_tell();
    optimizer.tell(jobs_to_tell)?;

    bars.println(preview_table(optimizer.minimal_df(), 10));

    if generate_report {
        // Report rendering is delegated to external tooling working off the
        // persisted tables and report data.
        info!("report data refreshed for report generation");
    }

    optimizer.advance_iteration();

    let result_dir = interface.paths().result_dir.clone();
    optimizer.save_data_and_self(&result_dir)?;
    save_report_data(&result_dir, &hook_stats)?;

    if num_best_jobs_whose_data_is_kept > 0 {
        let best_dirs = optimizer.best_jobs_working_dirs(num_best_jobs_whose_data_is_kept);
        update_best_job_datadirs(&result_dir, &best_dirs, remove_working_dirs).await?;
    }

    if remove_working_dirs {
        let finished: Vec<std::path::PathBuf> = optimizer
            .full_df()
            .column_values(crate::constants::WORKING_DIR)
            .into_iter()
            .flatten()
            .map(|value| std::path::PathBuf::from(value.to_string()))
            .collect();
        for dir in finished {
            rm_dir_full(&dir).await;
        }
    }
    Ok(())
}

/// Renders the first rows of a table for display above the bars.
fn preview_table(table: &Table, how_many: usize) -> String {
    let mut lines = vec![table.columns().join("  ")];
    for row in table.rows().take(how_many) {
        let cells: Vec<String> = table
            .columns()
            .iter()
            .map(|c| row.get(c).map(ToString::to_string).unwrap_or_default())
            .collect();
        lines.push(cells.join("  "));
    }
    lines.join("\n")
}

/// Pushes the current counts into the progress bars.
fn update_bars(bars: &mut ProgressBars, interface: &ClusterInterface) {
    bars.update_submitted(interface.n_submitted_jobs());
    bars.update_running(
        interface.n_running_jobs() + interface.n_completed_jobs(),
        interface.n_failed_jobs(),
    );
    bars.update_completed(interface.n_successful_jobs());
    bars.update_median_time_left(interface.median_time_left());
}

/// Checks the failure budget, closing the run when it is exceeded.
async fn check_failure_budget(interface: &mut ClusterInterface, slack: usize) -> Result<()> {
    let max_failed_jobs =
        interface.n_successful_jobs() + interface.n_running_jobs() + slack;
    let n_failed = interface.n_failed_jobs();
    if n_failed > max_failed_jobs {
        interface.close().await;
        return Err(EngineError::TooManyFailures(n_failed).into());
    }
    Ok(())
}

/// Runs an iterative hyperparameter optimization.
///
/// The optimizer proposes settings which are submitted as jobs; completed
/// results are fed back and close iterations of `n_jobs_per_iteration`
/// jobs each. The run ends when `number_of_samples` jobs completed, or
/// with [`RunOutcome::Interrupted`] on Ctrl-C.
pub async fn hp_optimization(
    settings: &Settings,
    paths: Paths,
    hooks: Vec<Box<dyn SubmissionHook>>,
) -> Result<RunOutcome> {
    let opt = settings
        .optimization_setting
        .clone()
        .ok_or_else(|| {
            EngineError::Settings("optimization_setting is required for hp_optimization".into())
        })?;
    let specs = settings.optimized_params.clone().ok_or_else(|| {
        EngineError::Settings("optimized_params is required for hp_optimization".into())
    })?;
    let remove_working_dirs = settings.remove_working_dirs.unwrap_or(true);

    let (mut interface, server, mut events) = pre_opt(settings, paths, hooks).await?;
    let mut optimizer = initialize_optimizer(
        &interface.paths().result_dir,
        &settings.optimizer_str,
        &specs,
        &opt.metric_to_optimize,
        opt.minimize,
        &settings.optimizer_settings,
    )?;

    save_metadata(
        &interface.paths().result_dir,
        RunType::HpOptimization,
        Local::now(),
    )?;

    let (console, mut console_rx) = if settings.no_user_interaction {
        Console::non_interactive()
    } else {
        Console::interactive()
    };
    let mut bars = ProgressBars::new(opt.number_of_samples, Some(opt.minimize));
    let mut handler = EventHandler::new(server.sender());
    let start_iteration = optimizer.iteration();
    let mut interrupted = false;
    let mut loop_error: Option<anyhow::Error> = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(JOB_MANAGER_LOOP_SLEEP_TIME);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while interface.n_completed_jobs() < opt.number_of_samples {
        tokio::select! {
            _ = &mut ctrl_c => {
                interrupted = true;
                break;
            }
            Some(event) = events.recv() => {
                handler.apply(&mut interface, event);
            }
            Some(ConsoleEvent::OpenShell) = console_rx.recv() => {
                console.pause();
                let outcome = bars.suspend(|| run_command_shell(&interface));
                console.resume();
                for job_id in outcome.jobs_to_cancel {
                    handler.apply(
                        &mut interface,
                        Event::Message(Message::ErrorEncountered {
                            job_id,
                            lines: vec!["Job cancelled by the user".to_string()],
                        }),
                    );
                }
            }
            _ = ticker.tick() => {
                let result = hp_tick(
                    settings,
                    &opt,
                    &mut interface,
                    &mut optimizer,
                    &mut bars,
                    &server,
                    start_iteration,
                ).await;
                if let Err(e) = result {
                    loop_error = Some(e);
                    break;
                }
            }
        }
    }

    bars.finish();
    println!();

    if let Some(e) = loop_error {
        return Err(e);
    }

    if interrupted {
        interface.close().await;
        info!("exiting now");
        return Ok(RunOutcome::Interrupted);
    }

    post_iteration_opt(
        &mut interface,
        &mut optimizer,
        &bars,
        settings.num_best_jobs_whose_data_is_kept,
        remove_working_dirs,
        matches!(
            settings.generate_report,
            GenerateReport::EveryIteration | GenerateReport::WhenFinished
        ),
    )
    .await?;
    post_opt(&mut interface).await;

    if remove_working_dirs {
        let working_dirs = interface.paths().current_result_dir.clone();
        rm_dir_full(&working_dirs).await;
    }

    Ok(RunOutcome::Completed)
}

/// One tick of the hp optimization loop.
#[allow(clippy::too_many_arguments)]
async fn hp_tick(
    settings: &Settings,
    opt: &crate::settings::OptimizationSetting,
    interface: &mut ClusterInterface,
    optimizer: &mut Box<dyn Optimizer>,
    bars: &mut ProgressBars,
    server: &CommunicationServer,
    start_iteration: usize,
) -> Result<()> {
    // Feed new results back into the optimizer.
    let jobs_to_tell = interface.jobs_to_tell();
    optimizer.tell(jobs_to_tell)?;

    // Iteration accounting and the submission throttle.
    let current_iteration = optimizer.iteration() - start_iteration;
    let n_completed = interface.n_completed_jobs();
    let n_submitted = interface.n_submitted_jobs();
    let n_completed_cur =
        n_completed.saturating_sub(opt.n_jobs_per_iteration * current_iteration);
    let n_submitted_cur =
        n_submitted.saturating_sub(opt.n_jobs_per_iteration * current_iteration);
    let max_submissions = max_submissions_in_iteration(
        n_completed_cur,
        opt.n_completed_jobs_before_resubmit,
        opt.n_jobs_per_iteration,
    );
    let iteration_finished = n_completed / opt.n_jobs_per_iteration > current_iteration;

    if n_submitted_cur < max_submissions
        && n_submitted < opt.number_of_samples
        && !iteration_finished
    {
        if let Some(new_settings) = optimizer.ask() {
            let job = Job::new(
                interface.inc_job_id(),
                new_settings,
                settings.fixed_params.clone(),
                optimizer.iteration() + 1,
                server.connection_info(),
                Some(opt.metric_to_optimize.clone()),
                settings.optimization_procedure_name.clone(),
            );
            interface.add_jobs(vec![job], true);
        }
    }

    if interface.has_unsubmitted_jobs() {
        interface.submit_next().await?;
    }

    if iteration_finished {
        post_iteration_opt(
            interface,
            optimizer,
            bars,
            settings.num_best_jobs_whose_data_is_kept,
            settings.remove_working_dirs.unwrap_or(true),
            settings.generate_report == GenerateReport::EveryIteration,
        )
        .await?;
        info!("starting new iteration: {}", optimizer.iteration());
    }

    if interface.is_ready_to_check_for_failed_jobs() {
        for msg in interface.check_for_failed_jobs().await? {
            bars.println(msg);
        }
    }

    check_failure_budget(interface, FAILURE_BUDGET_SLACK).await?;

    if settings.kill_bad_jobs_early {
        if let Some(params) = &settings.early_killing_params {
            kill_bad_looking_jobs(interface, &opt.metric_to_optimize, opt.minimize, params)
                .await?;
        }
    }

    update_bars(bars, interface);

    // The best value combines the best finished result with the best
    // intermediate report of the running jobs.
    let best_seen = interface.get_best_seen_value_of_main_metric(opt.minimize);
    let best_finished = optimizer
        .full_df()
        .row(0)
        .and_then(|row| row.get(&opt.metric_to_optimize))
        .and_then(ParamValue::as_f64);
    for estimate in [best_seen, best_finished].into_iter().flatten() {
        bars.update_best_val(estimate);
    }

    Ok(())
}

/// Runs an enumerated grid search.
///
/// All jobs are created up front; the loop submits up to five per tick and
/// waits for everything to complete. With `load_existing_results`, jobs
/// whose working directory already holds a metrics file are concluded
/// without running.
pub async fn grid_search(
    settings: &Settings,
    paths: Paths,
    hooks: Vec<Box<dyn SubmissionHook>>,
) -> Result<GridOutcome> {
    let hyperparams = settings.hyperparam_list.clone().ok_or_else(|| {
        EngineError::Settings("hyperparam_list is required for grid_search".into())
    })?;
    let restarts = settings.restarts.unwrap_or(1);
    let remove_working_dirs = settings.remove_working_dirs.unwrap_or(false);

    let (mut interface, server, mut events) = pre_opt(settings, paths, hooks).await?;
    let mut grid = GridSearchOptimizer::new(hyperparams, settings.samples, restarts)?;

    save_metadata(
        &interface.paths().result_dir,
        RunType::GridSearch,
        Local::now(),
    )?;

    let mut jobs = Vec::new();
    while let Some(setting) = grid.ask() {
        jobs.push(Job::new(
            interface.inc_job_id(),
            setting,
            settings.fixed_params.clone(),
            grid.iteration(),
            server.connection_info(),
            None,
            settings.optimization_procedure_name.clone(),
        ));
    }
    let total_jobs = jobs.len();
    let job_ids: Vec<usize> = jobs.iter().map(|j| j.id).collect();
    interface.add_jobs(jobs, true);

    if settings.load_existing_results {
        info!("trying to load existing results");
        let paths = interface.paths().clone();
        for job_id in &job_ids {
            if let Some(job) = interface.get_job_mut(*job_id) {
                job.try_load_results_from_filesystem(&paths)?;
            }
        }
        // Jobs concluded from prior results must not be submitted again.
        interface.prune_submission_queue();
    }

    let (console, mut console_rx) = if settings.no_user_interaction {
        Console::non_interactive()
    } else {
        Console::interactive()
    };
    let mut bars = ProgressBars::new(total_jobs, None);
    let mut handler = EventHandler::new(server.sender());
    let mut interrupted = false;
    let mut loop_error: Option<anyhow::Error> = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(JOB_MANAGER_LOOP_SLEEP_TIME);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while interface.n_completed_jobs() != total_jobs {
        tokio::select! {
            _ = &mut ctrl_c => {
                interrupted = true;
                break;
            }
            Some(event) = events.recv() => {
                handler.apply(&mut interface, event);
            }
            Some(ConsoleEvent::OpenShell) = console_rx.recv() => {
                console.pause();
                let outcome = bars.suspend(|| run_command_shell(&interface));
                console.resume();
                for job_id in outcome.jobs_to_cancel {
                    handler.apply(
                        &mut interface,
                        Event::Message(Message::ErrorEncountered {
                            job_id,
                            lines: vec!["Job cancelled by the user".to_string()],
                        }),
                    );
                }
            }
            _ = ticker.tick() => {
                let result = async {
                    // Submit the next batch of queued jobs.
                    let mut submitted = 0;
                    while interface.has_unsubmitted_jobs()
                        && submitted < GRID_SUBMISSIONS_PER_TICK
                    {
                        interface.submit_next().await?;
                        submitted += 1;
                    }

                    if interface.is_ready_to_check_for_failed_jobs() {
                        for msg in interface.check_for_failed_jobs().await? {
                            bars.println(msg);
                        }
                    }

                    check_failure_budget(&mut interface, GRID_SUBMISSIONS_PER_TICK).await?;
                    update_bars(&mut bars, &interface);
                    anyhow::Ok(())
                }.await;
                if let Err(e) = result {
                    loop_error = Some(e);
                    break;
                }
            }
        }
    }

    bars.finish();
    println!();

    if let Some(e) = loop_error {
        return Err(e);
    }

    if interrupted {
        interface.close().await;
        info!("exiting now");
        return Ok(GridOutcome::Interrupted);
    }

    let hook_stats = interface.collect_stats_from_hooks();
    post_opt(&mut interface).await;

    let mut results = Table::new();
    for job_id in job_ids {
        if let Some((row, _, _)) = interface.get_job(job_id).and_then(Job::results) {
            results.push_row(row.clone());
        }
    }

    if remove_working_dirs {
        let working_dirs = interface.paths().current_result_dir.clone();
        rm_dir_full(&working_dirs).await;
    }

    Ok(GridOutcome::Completed {
        results,
        hook_stats,
    })
}
