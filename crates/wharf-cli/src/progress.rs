//! Progress reporting with TTY detection.
//!
//! Shows a progress bar against stdout when it's a TTY, and falls back to
//! plain `[n/total]` lines on stderr otherwise (CI logs, piped output).

use std::time::Instant;

use atty::Stream;
use indicatif::{ProgressBar, ProgressStyle};

/// Detects whether stdout is connected to a TTY.
pub fn is_tty() -> bool {
    atty::is(Stream::Stdout)
}

/// Progress reporter for a rollout: one unit per host.
pub struct ProgressReporter {
    is_tty: bool,
    total_hosts: usize,
    current_host: usize,
    current_name: String,
    progress_bar: Option<ProgressBar>,
    start_time: Instant,
}

impl ProgressReporter {
    /// Creates a new progress reporter for `total_hosts` hosts.
    pub fn new(total_hosts: usize) -> Self {
        let is_tty = is_tty();
        let progress_bar = if is_tty {
            let pb = ProgressBar::new(total_hosts as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        Self {
            is_tty,
            total_hosts,
            current_host: 0,
            current_name: String::new(),
            progress_bar,
            start_time: Instant::now(),
        }
    }

    /// Creates a silent progress reporter that always uses non-TTY mode.
    #[allow(dead_code)]
    pub fn silent(total_hosts: usize) -> Self {
        Self {
            is_tty: false,
            total_hosts,
            current_host: 0,
            current_name: String::new(),
            progress_bar: None,
            start_time: Instant::now(),
        }
    }

    /// Sets the host currently being deployed.
    ///
    /// `index` is the 1-indexed position of the host in rollout order.
    pub fn set_host(&mut self, index: usize, host_key: &str) {
        self.current_host = index;
        self.current_name = host_key.to_string();

        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                let elapsed = self.start_time.elapsed();
                let msg = format!(
                    "[{}/{}] Deploying {}... ({elapsed:?})",
                    self.current_host, self.total_hosts, self.current_name
                );
                pb.set_message(msg);
                pb.set_position((self.current_host - 1) as u64);
            }
        } else {
            let elapsed = self.start_time.elapsed();
            eprintln!(
                "[{}/{}] Deploying {}... ({elapsed:?})",
                self.current_host, self.total_hosts, self.current_name
            );
        }
    }

    /// Marks the current host as completed.
    #[allow(clippy::collapsible_if)]
    #[allow(dead_code)]
    pub fn finish_host(&mut self) {
        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                pb.inc(1);
            }
        }
    }

    /// Sets a status message (e.g. "draining from balancers...").
    #[allow(dead_code)]
    pub fn set_status(&self, status: &str) {
        if self.is_tty {
            if let Some(ref pb) = self.progress_bar {
                let current = pb.position();
                let msg = format!("[{}/{}] {}", current + 1, self.total_hosts, status);
                pb.set_message(msg);
            }
        } else {
            eprintln!("[status] {}", status);
        }
    }

    /// Finishes the progress reporting.
    pub fn finish(self) {
        if self.is_tty {
            if let Some(pb) = self.progress_bar {
                let elapsed = self.start_time.elapsed();
                let msg = format!("Completed {} hosts in {:?}", self.total_hosts, elapsed);
                pb.set_message(msg);
                pb.finish();
            }
        } else {
            let elapsed = self.start_time.elapsed();
            eprintln!(
                "Completed {}/{} hosts in {:?}",
                self.total_hosts, self.total_hosts, elapsed
            );
        }
    }
}
