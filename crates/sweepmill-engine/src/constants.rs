//! Shared constants for file names, timings, and naming rules.

use std::time::Duration;

/// Name of the CSV file to which the chosen parameters of a job are saved.
pub const CLUSTER_PARAM_FILE: &str = "param_choice.csv";

/// Name of the CSV file to which the resulting metrics of a job are saved.
pub const CLUSTER_METRIC_FILE: &str = "metrics.csv";

/// Name of the JSON file to which the full settings of a job are saved.
pub const JSON_SETTINGS_FILE: &str = "settings.json";

/// Name of the run metadata file in the results directory.
pub const METADATA_FILE: &str = "metadata.json";

/// Name of the optimizer snapshot file in the results directory.
pub const STATUS_SNAPSHOT_FILE: &str = "status.pickle";

/// Name of the CSV file holding one row per completed job.
pub const FULL_DF_FILE: &str = "all_data.csv";

/// Name of the CSV file holding rows averaged over identical parameter
/// choices.
pub const REDUCED_DF_FILE: &str = "reduced_data.csv";

/// Name of the file holding submission hook statistics.
pub const REPORT_DATA_FILE: &str = "report_data.pickle";

/// Suffix appended to metric column names holding standard deviations.
pub const STD_ENDING: &str = "__std";

/// Column name counting how many restarts contributed to an averaged row.
pub const RESTART_PARAM_NAME: &str = "job_restarts";

/// Separator used in flattened parameter names (`a.b.c`).
pub const OBJECT_SEPARATOR: char = '.';

/// Column name holding a job's working directory.
pub const WORKING_DIR: &str = "working_dir";

/// Column name holding a job's identifier.
pub const ID: &str = "_id";

/// Column name holding the optimizer iteration a result belongs to.
pub const ITERATION: &str = "_iteration";

/// Parameter names that may not be used in settings or fixed parameters.
pub const RESERVED_PARAMS: &[&str] = &[ID, ITERATION, RESTART_PARAM_NAME, WORKING_DIR];

/// How long a job may stay in the concluded-without-results state before it
/// is considered failed.
pub const CONCLUDED_WITHOUT_RESULTS_GRACE_TIME: Duration = Duration::from_secs(5);

/// Sleep between two ticks of the orchestrator control loop.
pub const JOB_MANAGER_LOOP_SLEEP_TIME: Duration = Duration::from_millis(200);

/// Return code with which a user program requests to be resumed.
pub const RETURN_CODE_FOR_RESUME: i32 = 3;

/// Number of attempts for a single backend submission.
pub const SUBMISSION_RETRIES: usize = 10;

/// Timeout for one backend submission attempt.
pub const SUBMISSION_TIMEOUT: Duration = Duration::from_secs(15);
