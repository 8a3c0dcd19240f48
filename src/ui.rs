//! Terminal rendering of a job's progress events.
//!
//! A spinner tracks the patch currently running; finished steps are
//! printed above it in colour.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use webpatcher::events::{ProgressEvent, ProgressKind, Severity};
use webpatcher::job::{Job, JobStatus};

pub struct JobProgress {
    pb: ProgressBar,
    verbose: bool,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl JobProgress {
    pub fn start(description: &str, verbose: bool) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(description.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            verbose,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    pub fn event(&self, event: &ProgressEvent) {
        match event.kind {
            ProgressKind::PatchStarted | ProgressKind::JobStarted => {
                self.pb.set_message(event.message.clone());
            }
            ProgressKind::PatchSucceeded => {
                self.pb
                    .println(format!("  {} {}", self.green.apply_to("✓"), event.message));
            }
            ProgressKind::PatchFailed | ProgressKind::JobFailed => {
                self.pb
                    .println(format!("  {} {}", self.red.apply_to("✗"), event.message));
            }
            ProgressKind::JobCompleted => {
                self.pb
                    .println(format!("  {} {}", self.green.apply_to("●"), event.message));
            }
            ProgressKind::Info if event.severity != Severity::Info => {
                self.pb
                    .println(format!("  {} {}", self.yellow.apply_to("!"), event.message));
            }
            ProgressKind::JobPrepared | ProgressKind::PatchQueued | ProgressKind::Info => {
                if self.verbose {
                    self.pb.println(format!(
                        "  {} {}",
                        self.dim.apply_to(event.timestamp.format("%H:%M:%S%.3f")),
                        self.dim.apply_to(&event.message)
                    ));
                }
            }
        }
    }

    /// Stop the spinner and print the final job snapshot.
    pub fn finish(&self, job: &Job) {
        self.pb.finish_and_clear();
        let status_style = match job.status {
            JobStatus::Success => &self.green,
            JobStatus::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", status_style.apply_to(format!("─── Job {} ───", job.status)));
        println!("{}", serde_json::to_string_pretty(job).unwrap_or_default());
    }
}
