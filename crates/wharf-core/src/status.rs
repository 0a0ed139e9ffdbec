//! Deployment status tracker (spec.md §4.11): a single in-memory record
//! updated by the archive reconciler at each labelled step, read by the
//! `/deploy/status` handler (and the CLI's long-poll transport client).
//!
//! Writers publish fields in an order that keeps readers consistent:
//! `started_at` is written before `deploying` flips to `true`; writers
//! clear `deploying` and write `last_completed_at` only after the result
//! is final (§5, "shared resources").

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use wharf_types::{DeployResult, DeploymentStatus};

/// A reader's view of the status record, with a derived `elapsed_ms` for
/// in-progress deployments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub status: DeploymentStatus,
    pub elapsed_ms: Option<u64>,
}

/// Thread-safe handle to the single deployment-status record. Cheap to
/// clone (an `Arc`); every clone shares the same underlying record, which
/// is the point — the agent's axum handlers and the reconciler both hold
/// a clone.
#[derive(Debug, Clone)]
pub struct StatusTracker {
    inner: Arc<Mutex<DeploymentStatus>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(DeploymentStatus::default())) }
    }

    /// Begin a new deployment: allocate a deployment id, publish
    /// `started_at`, then flip `deploying` to true.
    pub fn start(&self, first_step: &str) {
        let mut status = self.inner.lock().expect("status mutex poisoned");
        let now = Utc::now();
        status.started_at = Some(now);
        status.deployment_id = Some(format!("dep-{}", now.timestamp_nanos_opt().unwrap_or_default()));
        status.current_step = Some(first_step.to_string());
        status.deploying = true;
    }

    pub fn set_step(&self, step: &str) {
        let mut status = self.inner.lock().expect("status mutex poisoned");
        status.current_step = Some(step.to_string());
    }

    /// Publish the terminal result, clear `deploying`, record
    /// `last_completed_at` strictly after that flip.
    pub fn finish(&self, result: DeployResult) {
        let mut status = self.inner.lock().expect("status mutex poisoned");
        status.deploying = false;
        status.current_step = None;
        status.deployment_id = None;
        status.started_at = None;
        status.last_result = Some(result);
        status.last_completed_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let status = self.inner.lock().expect("status mutex poisoned").clone();
        let elapsed_ms = status
            .started_at
            .map(|start| (Utc::now() - start).num_milliseconds().max(0) as u64);
        StatusSnapshot { status, elapsed_ms }
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}
