//! End-to-end tests running real jobs on the local backend.
//!
//! The user program in these tests is a trivial shell script; the test
//! itself plays the role of the client library by parsing the generated
//! run scripts for the communication server address and sending the
//! lifecycle datagrams.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use sweepmill_engine::GridOutcome;
use sweepmill_engine::Message;
use sweepmill_engine::Paths;
use sweepmill_engine::RunOutcome;
use sweepmill_engine::Settings;
use sweepmill_engine::constants::FULL_DF_FILE;
use sweepmill_engine::constants::STATUS_SNAPSHOT_FILE;
use sweepmill_engine::grid_search;
use sweepmill_engine::hp_optimization;
use sweepmill_engine::results::Table;

/// How long the tests wait for the run to finish.
const TEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Determines if local execution is possible on this machine.
fn local_execution_available() -> bool {
    which::which("taskset").is_ok() && which::which("bash").is_ok()
}

/// Builds run paths rooted in the given directory and places a do-nothing
/// user script into the project directory.
fn prepare_project(root: &Path) -> Paths {
    let main_path = root.join("project");
    std::fs::create_dir_all(&main_path).unwrap();

    let script = main_path.join("main.sh");
    std::fs::write(&script, "#!/bin/bash\nsleep 1\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    Paths {
        main_path,
        script_to_run: PathBuf::from("main.sh"),
        result_dir: root.join("results"),
        jobs_dir: root.join("jobs"),
        current_result_dir: root.join("results/working_directories"),
    }
}

/// A job discovered by scanning the jobs directory for run scripts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DiscoveredJob {
    /// The job id parsed from the command line.
    job_id: usize,
    /// The communication server address parsed from the command line.
    server: SocketAddr,
}

/// Scans the jobs directory for run scripts of not-yet-served jobs.
fn discover_jobs(jobs_dir: &Path, served: &HashSet<usize>) -> Vec<DiscoveredJob> {
    let Ok(entries) = std::fs::read_dir(jobs_dir) else {
        return Vec::new();
    };

    let mut discovered = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sh") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };

        let job_id = content
            .split_whitespace()
            .find_map(|token| token.strip_prefix("--job-id="))
            .and_then(|id| id.parse().ok());
        let server = content
            .split_whitespace()
            .find_map(|token| token.strip_prefix("--cluster-utils-server="))
            .and_then(|addr| addr.parse().ok());
        if let (Some(job_id), Some(server)) = (job_id, server) {
            if !served.contains(&job_id) {
                discovered.push(DiscoveredJob { job_id, server });
            }
        }
    }
    discovered
}

/// Sends a message to the communication server of a discovered job.
fn send(job: &DiscoveredJob, message: &Message) {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
    socket
        .send_to(&message.encode().unwrap(), job.server)
        .unwrap();
}

/// The metrics map `{loss: <value>}`.
fn loss(value: f64) -> IndexMap<String, f64> {
    [("loss".to_string(), value)].into_iter().collect()
}

/// Plays the client side for every job: started, results, concluded.
///
/// The loss of each job is its id, so results are easy to check.
async fn drive_jobs(jobs_dir: PathBuf, n_jobs: usize) {
    let deadline = std::time::Instant::now() + TEST_TIMEOUT;
    let mut served = HashSet::new();
    while served.len() < n_jobs && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
        for job in discover_jobs(&jobs_dir, &served) {
            send(
                &job,
                &Message::JobStarted {
                    job_id: job.job_id,
                    hostname: "localhost".to_string(),
                },
            );
            send(
                &job,
                &Message::MetricEarlyReport {
                    job_id: job.job_id,
                    metrics: loss(job.job_id as f64 + 1.0),
                },
            );
            send(
                &job,
                &Message::JobSentResults {
                    job_id: job.job_id,
                    metrics: loss(job.job_id as f64),
                },
            );
            send(&job, &Message::JobConcluded { job_id: job.job_id });
            served.insert(job.job_id);
        }
    }
}

/// Plays a client that asks for one resume before finishing.
async fn drive_job_with_resume(jobs_dir: PathBuf) {
    // Wait for the first submission.
    let deadline = std::time::Instant::now() + TEST_TIMEOUT;
    let job = loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(job) = discover_jobs(&jobs_dir, &HashSet::new()).first().cloned() {
            break job;
        }
        if std::time::Instant::now() >= deadline {
            return;
        }
    };

    send(
        &job,
        &Message::JobStarted {
            job_id: job.job_id,
            hostname: "localhost".to_string(),
        },
    );
    send(&job, &Message::ExitForResume { job_id: job.job_id });

    // Give the orchestrator time to re-submit, then finish normally.
    tokio::time::sleep(Duration::from_secs(2)).await;
    send(
        &job,
        &Message::JobStarted {
            job_id: job.job_id,
            hostname: "localhost".to_string(),
        },
    );
    send(
        &job,
        &Message::JobSentResults {
            job_id: job.job_id,
            metrics: loss(0.5),
        },
    );
    send(&job, &Message::JobConcluded { job_id: job.job_id });
}

#[tokio::test]
async fn grid_search_runs_jobs_locally() {
    if !local_execution_available() {
        eprintln!("skipping: taskset is not available");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let paths = prepare_project(dir.path());
    let settings: Settings = serde_json::from_value(serde_json::json!({
        "optimization_procedure_name": "local_grid",
        "results_dir": "results",
        "script_relative_path": "main.sh",
        "cluster_requirements": {"request_cpus": 1, "max_cpus": 2},
        "hyperparam_list": [{"param": "x", "values": [0, 1]}],
        "restarts": 1,
        "no_user_interaction": true,
        "run_local": true,
        "remove_jobs_dir": false,
        "environment_setup": {"is_python_script": false}
    }))
    .unwrap();

    let jobs_dir = paths.jobs_dir.clone();
    let run = async {
        tokio::time::timeout(TEST_TIMEOUT, grid_search(&settings, paths.clone(), Vec::new()))
            .await
            .expect("run should not time out")
    };
    let (outcome, ()) = tokio::join!(run, drive_jobs(jobs_dir, 2));

    let GridOutcome::Completed { results, .. } = outcome.expect("run should succeed") else {
        panic!("run should complete");
    };
    assert_eq!(results.len(), 2);
    for row in results.rows() {
        let id = row["_id"].as_f64().unwrap();
        assert_eq!(row["loss"].as_f64(), Some(id));
    }
}

#[tokio::test]
async fn resumed_job_produces_a_single_result_row() {
    if !local_execution_available() {
        eprintln!("skipping: taskset is not available");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let paths = prepare_project(dir.path());
    let settings: Settings = serde_json::from_value(serde_json::json!({
        "optimization_procedure_name": "local_resume",
        "results_dir": "results",
        "script_relative_path": "main.sh",
        "cluster_requirements": {"request_cpus": 1, "max_cpus": 2},
        "hyperparam_list": [{"param": "x", "values": [7]}],
        "restarts": 1,
        "no_user_interaction": true,
        "run_local": true,
        "remove_jobs_dir": false,
        "environment_setup": {"is_python_script": false}
    }))
    .unwrap();

    let jobs_dir = paths.jobs_dir.clone();
    let run = async {
        tokio::time::timeout(TEST_TIMEOUT, grid_search(&settings, paths.clone(), Vec::new()))
            .await
            .expect("run should not time out")
    };
    let (outcome, ()) = tokio::join!(run, drive_job_with_resume(jobs_dir));

    let GridOutcome::Completed { results, .. } = outcome.expect("run should succeed") else {
        panic!("run should complete");
    };
    // The job started, exited for resume, restarted, and concluded: exactly
    // one result row.
    assert_eq!(results.len(), 1);
    assert_eq!(results.row(0).unwrap()["loss"].as_f64(), Some(0.5));
}

#[tokio::test]
async fn hp_optimization_completes_a_sample_budget() {
    if !local_execution_available() {
        eprintln!("skipping: taskset is not available");
        return;
    }

    let dir = tempfile::tempdir().unwrap();
    let paths = prepare_project(dir.path());
    let settings: Settings = serde_json::from_value(serde_json::json!({
        "optimization_procedure_name": "local_hp",
        "results_dir": "results",
        "script_relative_path": "main.sh",
        "cluster_requirements": {"request_cpus": 1, "max_cpus": 2},
        "optimized_params": [
            {"param": "lr", "distribution": "TruncatedLogNormal", "bounds": [1e-4, 1.0]}
        ],
        "optimization_setting": {
            "metric_to_optimize": "loss",
            "minimize": true,
            "number_of_samples": 2,
            "n_jobs_per_iteration": 2
        },
        "no_user_interaction": true,
        "run_local": true,
        "remove_jobs_dir": false,
        "remove_working_dirs": false,
        "environment_setup": {"is_python_script": false}
    }))
    .unwrap();

    let jobs_dir = paths.jobs_dir.clone();
    let run = async {
        tokio::time::timeout(
            TEST_TIMEOUT,
            hp_optimization(&settings, paths.clone(), Vec::new()),
        )
        .await
        .expect("run should not time out")
    };
    let (outcome, ()) = tokio::join!(run, drive_jobs(jobs_dir, 2));
    assert_eq!(outcome.expect("run should succeed"), RunOutcome::Completed);

    // The optimizer persisted its tables and snapshot.
    let full_df = Table::read_csv(&paths.result_dir.join(FULL_DF_FILE)).unwrap();
    assert_eq!(full_df.len(), 2);
    assert!(paths.result_dir.join(STATUS_SNAPSHOT_FILE).exists());

    let metadata =
        std::fs::read_to_string(paths.result_dir.join(sweepmill_engine::constants::METADATA_FILE))
            .unwrap();
    assert!(metadata.contains("HP_OPTIMIZATION"));
}
