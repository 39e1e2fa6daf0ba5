//! The interactive console.
//!
//! While a run is in progress the terminal stays in raw mode and a
//! background thread watches for the escape key. When it is pressed, the
//! orchestrator suspends the progress bars and opens a line-based command
//! shell for inspecting and cancelling jobs. The non-interactive variant
//! never reports a key press.

use std::io::IsTerminal;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crossterm::event::Event as TermEvent;
use crossterm::event::KeyCode;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

use crate::backend::ClusterInterface;
use crate::utils::ask_yes_no;

/// A request raised by the keyboard watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// The user pressed escape and wants the command shell.
    OpenShell,
}

/// The keyboard watcher of a run.
///
/// Dropping the console stops the watcher thread and restores the terminal.
#[derive(Debug)]
pub struct Console {
    /// Whether the watcher currently owns the terminal.
    active: Arc<AtomicBool>,
    /// Whether the watcher should exit.
    stop: Arc<AtomicBool>,
    /// Whether raw mode was enabled and must be restored.
    raw_mode: bool,
}

impl Console {
    /// Starts the keyboard watcher.
    ///
    /// Returns a no-op console when stdin is not a terminal.
    pub fn interactive() -> (Self, mpsc::Receiver<ConsoleEvent>) {
        let (tx, rx) = mpsc::channel(4);
        if !std::io::stdin().is_terminal() {
            return (Self::noop(), rx);
        }
        if let Err(e) = crossterm::terminal::enable_raw_mode() {
            warn!("failed to enable raw mode, interactive console disabled: {e}");
            return (Self::noop(), rx);
        }

        let active = Arc::new(AtomicBool::new(true));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_active = active.clone();
        let thread_stop = stop.clone();
        std::thread::spawn(move || {
            while !thread_stop.load(Ordering::Relaxed) {
                if !thread_active.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
                if !crossterm::event::poll(Duration::from_millis(200)).unwrap_or(false) {
                    continue;
                }
                let Ok(event) = crossterm::event::read() else {
                    continue;
                };
                if let TermEvent::Key(key) = event {
                    if key.code == KeyCode::Esc && tx.blocking_send(ConsoleEvent::OpenShell).is_err()
                    {
                        break;
                    }
                }
            }
        });

        (
            Self {
                active,
                stop,
                raw_mode: true,
            },
            rx,
        )
    }

    /// A console that never reports anything.
    pub fn non_interactive() -> (Self, mpsc::Receiver<ConsoleEvent>) {
        let (_tx, rx) = mpsc::channel(1);
        (Self::noop(), rx)
    }

    /// Builds the inert console value.
    fn noop() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(true)),
            raw_mode: false,
        }
    }

    /// Releases the terminal to cooked mode for line-based input.
    pub fn pause(&self) {
        self.active.store(false, Ordering::Relaxed);
        if self.raw_mode {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }

    /// Takes the terminal back after line-based input.
    pub fn resume(&self) {
        if self.raw_mode {
            let _ = crossterm::terminal::enable_raw_mode();
        }
        self.active.store(true, Ordering::Relaxed);
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.raw_mode {
            let _ = crossterm::terminal::disable_raw_mode();
        }
    }
}

/// What the command shell asked the orchestrator to do.
#[derive(Debug, Default)]
pub struct ShellOutcome {
    /// Jobs the user wants cancelled.
    pub jobs_to_cancel: Vec<usize>,
}

/// The verbs of the command shell.
const SHELL_COMMANDS: &[&str] = &[
    "list_jobs",
    "list_running_jobs",
    "list_successful_jobs",
    "list_idle_jobs",
    "show_job",
    "stop_remaining_jobs",
];

/// Runs one round of the command shell on a cooked terminal.
///
/// The caller is responsible for suspending the progress bars and pausing
/// the keyboard watcher around this call.
pub fn run_command_shell(interface: &ClusterInterface) -> ShellOutcome {
    let mut outcome = ShellOutcome::default();

    println!();
    println!("Enter command, e.g. {}", SHELL_COMMANDS.join(", "));
    print!(">>> ");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return outcome;
    }

    match line.trim() {
        "list_jobs" => {
            println!("List of all jobs:");
            println!("{:?}", interface.jobs().iter().map(|j| j.id).collect::<Vec<_>>());
        }
        "list_running_jobs" => {
            println!("List of running jobs:");
            println!("{:?}", interface.running_jobs().map(|j| j.id).collect::<Vec<_>>());
        }
        "list_successful_jobs" => {
            println!("List of successful jobs:");
            println!(
                "{:?}",
                interface.successful_jobs().map(|j| j.id).collect::<Vec<_>>()
            );
        }
        "list_idle_jobs" => {
            println!("List of idle jobs:");
            println!("{:?}", interface.idle_jobs().map(|j| j.id).collect::<Vec<_>>());
        }
        "show_job" => {
            println!("Enter ID");
            let mut id_line = String::new();
            if std::io::stdin().read_line(&mut id_line).is_err() {
                return outcome;
            }
            match id_line.trim().parse::<usize>().ok().and_then(|id| interface.get_job(id)) {
                Some(job) => println!("{job:#?}"),
                None => println!("Error encountered, maybe invalid ID?"),
            }
        }
        "stop_remaining_jobs" => {
            let successful = interface.successful_job_ids();
            let jobs_to_cancel: Vec<usize> = interface
                .jobs()
                .iter()
                .map(|j| j.id)
                .filter(|id| !successful.contains(id))
                .collect();
            println!("{jobs_to_cancel:?}");
            if ask_yes_no("Are you sure you want to stop all remaining jobs?", false) {
                info!("user manually stopped all remaining jobs");
                println!("Cancelled all remaining jobs.");
                outcome.jobs_to_cancel = jobs_to_cancel;
            }
        }
        "" => {}
        other => println!("Unknown command `{other}`"),
    }

    outcome
}
