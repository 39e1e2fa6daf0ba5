//! Submission hooks.
//!
//! A hook is a side-effect module registered with the cluster interface; it
//! runs once before the first submission and once after the run (e.g. to
//! clone a repository into the project path or to capture metadata). Hooks
//! that report an errored state at registration time are skipped with a
//! warning rather than failing the run.

use anyhow::Result;

/// The self-reported state of a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    /// The hook is functional.
    Healthy,
    /// The hook encountered errors and must be skipped.
    Errored,
}

/// A side-effect module running around job submission.
pub trait SubmissionHook: Send + std::fmt::Debug {
    /// A unique identifier for the hook.
    fn identifier(&self) -> &str;

    /// Gets the state determined at construction time.
    fn state(&self) -> HookState;

    /// Runs once before the first job is submitted.
    fn pre_run_routine(&mut self) -> Result<()>;

    /// Runs once after the run has finished.
    ///
    /// The default updates the status one last time.
    fn post_run_routine(&mut self) -> Result<()> {
        self.update_status()
    }

    /// Refreshes the status string reported by [`SubmissionHook::status`].
    fn update_status(&mut self) -> Result<()>;

    /// Gets the current status of the hook, if any.
    fn status(&self) -> Option<String>;
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// A hook recording its invocations, for tests.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingHook {
        /// Whether the hook reports itself errored.
        pub errored: bool,
        /// Number of pre-run invocations.
        pub pre_runs: usize,
        /// Number of status updates.
        pub updates: usize,
    }

    impl SubmissionHook for RecordingHook {
        fn identifier(&self) -> &str {
            "recording"
        }

        fn state(&self) -> HookState {
            if self.errored {
                HookState::Errored
            } else {
                HookState::Healthy
            }
        }

        fn pre_run_routine(&mut self) -> Result<()> {
            self.pre_runs += 1;
            Ok(())
        }

        fn update_status(&mut self) -> Result<()> {
            self.updates += 1;
            Ok(())
        }

        fn status(&self) -> Option<String> {
            Some(format!("{} updates", self.updates))
        }
    }
}
