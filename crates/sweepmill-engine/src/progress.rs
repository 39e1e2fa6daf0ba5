//! Terminal progress reporting.
//!
//! Three bars track a run: how many jobs were submitted, how many started
//! executing (with a failure count), and how many completed (with the
//! median time left and the best metric value seen so far). Ordinary
//! output is routed through the bar set so it appears above the bars
//! instead of tearing through them.

use indicatif::MultiProgress;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;

/// The progress bars of a run.
#[derive(Debug)]
pub struct ProgressBars {
    /// The bar set; also the print router.
    multi: MultiProgress,
    /// Jobs handed to the backend.
    submitted: ProgressBar,
    /// Jobs that started executing.
    running: ProgressBar,
    /// Jobs that completed successfully.
    completed: ProgressBar,
    /// Whether the best value is the minimum or maximum seen.
    minimize: Option<bool>,
    /// The formatted median time left, shown behind the completed bar.
    median_eta: Option<String>,
    /// The best metric value seen so far.
    best_value: Option<f64>,
}

impl ProgressBars {
    /// Creates the three bars for a run of `total_jobs` jobs.
    ///
    /// `minimize` states the direction of the watched metric; `None` (for
    /// grid searches) disables the best-value readout.
    pub fn new(total_jobs: usize, minimize: Option<bool>) -> Self {
        let multi = MultiProgress::new();

        let style = ProgressStyle::with_template("{prefix:<18} {bar:40} | {pos}/{len}{msg}")
            .expect("progress template should parse");

        let submitted = multi.add(ProgressBar::new(total_jobs as u64));
        submitted.set_style(style.clone());
        submitted.set_prefix("Submitted");

        let running = multi.add(ProgressBar::new(total_jobs as u64));
        running.set_style(style.clone());
        running.set_prefix("Started execution");

        let completed = multi.add(ProgressBar::new(total_jobs as u64));
        completed.set_style(style);
        completed.set_prefix("Completed");

        Self {
            multi,
            submitted,
            running,
            completed,
            minimize,
            median_eta: None,
            best_value: None,
        }
    }

    /// Prints a line above the bars.
    pub fn println(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            println!("{}", msg.as_ref());
        }
    }

    /// Hides the bars while running a closure (e.g. an interactive shell).
    pub fn suspend<T>(&self, f: impl FnOnce() -> T) -> T {
        self.multi.suspend(f)
    }

    /// Advances a bar, ignoring transient negative updates.
    fn advance(bar: &ProgressBar, value: usize) {
        let value = value as u64;
        if value > bar.position() {
            bar.set_position(value);
        }
    }

    /// Updates the submitted-jobs bar.
    pub fn update_submitted(&self, n_submitted: usize) {
        Self::advance(&self.submitted, n_submitted);
    }

    /// Updates the started-execution bar and its failure count.
    pub fn update_running(&mut self, n_started: usize, n_failed: usize) {
        if n_failed > 0 {
            self.running.set_message(format!(", Failed: {n_failed}"));
        }
        Self::advance(&self.running, n_started);
    }

    /// Updates the completed-jobs bar.
    pub fn update_completed(&self, n_completed: usize) {
        Self::advance(&self.completed, n_completed);
    }

    /// Updates the median time-left readout.
    pub fn update_median_time_left(&mut self, median: String) {
        if !median.is_empty() {
            self.median_eta = Some(median);
            self.refresh_completed_message();
        }
    }

    /// Folds a new candidate into the best-value readout.
    pub fn update_best_val(&mut self, value: f64) {
        let best = match (self.best_value, self.minimize) {
            (Some(current), Some(true)) => current.min(value),
            (Some(current), _) => current.max(value),
            (None, _) => value,
        };
        self.best_value = Some(best);
        self.refresh_completed_message();
    }

    /// Renders the postfix of the completed bar.
    fn refresh_completed_message(&self) {
        let mut parts = Vec::new();
        if let Some(eta) = &self.median_eta {
            parts.push(format!("MedianETA: {eta}"));
        }
        if let Some(best) = self.best_value {
            parts.push(format!("best_value: {best}"));
        }
        if !parts.is_empty() {
            self.completed.set_message(format!(", {}", parts.join(", ")));
        }
    }

    /// Finishes the bars, leaving them on screen.
    pub fn finish(&self) {
        self.submitted.finish();
        self.running.finish();
        self.completed.finish();
    }
}
