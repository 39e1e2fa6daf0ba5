//! The error taxonomy of the orchestration engine.

use thiserror::Error;

/// Errors surfaced by the orchestration engine.
///
/// Transient backend failures are retried internally and never reach this
/// type; every variant here is fatal for the current run.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A backend CLI invocation failed beyond the retry budget.
    #[error("job submission failed: {0}")]
    Submission(String),

    /// More jobs failed than the failure budget allows.
    #[error("Too many ({0}) jobs failed. Ending procedure.")]
    TooManyFailures(usize),

    /// The settings refused validation (reserved names, malformed overrides).
    #[error("invalid settings: {0}")]
    Settings(String),

    /// A job result is missing the metric the optimizer ranks by.
    #[error(
        "Trying to optimize metric `{metric}` but it is not provided by job {job_id}."
    )]
    MissingMetric {
        /// The name of the metric the optimizer expects.
        metric: String,
        /// The id of the job whose results lack the metric.
        job_id: usize,
    },

    /// An optimizer snapshot does not match the requested optimization.
    #[error("Attempted to continue but optimizes a different metric!")]
    SnapshotMismatch,

    /// A submission hook was addressed by an unknown identifier.
    #[error("submission hook `{0}` is not registered")]
    HookNotFound(String),
}
