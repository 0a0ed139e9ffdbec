//! Event logging for wharf rollouts.
//!
//! This crate provides an append-only JSONL event log for tracking a
//! rollout run, with support for per-host filtering. It backs the `wharf
//! events` CLI subcommand and the testable-property audit trail (§8).
//!
//! # Example
//!
//! ```
//! use wharf_events::{EventLog, events_path};
//! use wharf_types::{RolloutEvent, RolloutEventType};
//!
//! let mut log = EventLog::new();
//! log.record(RolloutEvent::now(
//!     None,
//!     RolloutEventType::RolloutStarted { strategy: "1+R".into(), host_count: 3 },
//! ));
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use wharf_types::RolloutEvent;

/// Default events file name
pub const EVENTS_FILE: &str = "events.jsonl";

/// Get the events file path for a state directory
pub fn events_path(state_dir: &Path) -> PathBuf {
    state_dir.join(EVENTS_FILE)
}

/// Append-only event log for a rollout run.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<RolloutEvent>,
}

impl EventLog {
    /// Create a new empty event log.
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    /// Record a new event.
    pub fn record(&mut self, event: RolloutEvent) {
        self.events.push(event);
    }

    /// Write all recorded events to a file in JSONL format.
    ///
    /// Events are appended to the file if it already exists.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let mut writer = std::io::BufWriter::new(file);

        for event in &self.events {
            let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
            writeln!(writer, "{}", line).context("failed to write event line")?;
        }

        writer.flush().context("failed to flush events file")?;

        Ok(())
    }

    /// Append a single event directly to a file, without buffering the
    /// rest of the run in memory. Used by the coordinator, which writes
    /// as it goes rather than batching at the end.
    pub fn append_one(path: &Path, event: &RolloutEvent) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create events dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        let line = serde_json::to_string(event).context("failed to serialize event to JSON")?;
        writeln!(file, "{}", line).context("failed to write event line")
    }

    /// Read all events from a JSONL file.
    pub fn read_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }

        let file = File::open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;

        let reader = BufReader::new(file);
        let mut events = Vec::new();

        for line in reader.lines() {
            let line = line.with_context(|| {
                format!("failed to read line from events file {}", path.display())
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let event: RolloutEvent = serde_json::from_str(&line)
                .with_context(|| format!("failed to parse event JSON from line: {}", line))?;
            events.push(event);
        }

        Ok(Self { events })
    }

    /// Get all events for a specific host key (`"address:port"`).
    pub fn events_for_host<'a>(&'a self, host: &str) -> Vec<&'a RolloutEvent> {
        self.events
            .iter()
            .filter(|e| e.host.as_deref() == Some(host))
            .collect()
    }

    /// Get all recorded events.
    pub fn all_events(&self) -> &[RolloutEvent] {
        &self.events
    }

    /// Clear all recorded events from memory.
    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Get the number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
