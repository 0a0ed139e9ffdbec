//! Persisted, resumable rollout records (ambient, SPEC_FULL.md §5). A
//! [`wharf_types::RolloutRecord`] is written to `<state_dir>/rollout.json`
//! after every host's terminal state changes, so an interrupted `wharf
//! deploy` can be resumed with `--resume` against the same plan.
//!
//! Grounded on the teacher's `state.rs` (atomic-write-then-rename JSON
//! persistence) and `plan.rs`'s `compute_plan_id`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use wharf_types::{DeploymentStrategy, HostDescriptor, RolloutRecord};

pub const ROLLOUT_FILE: &str = "rollout.json";

pub fn rollout_path(state_dir: &Path) -> PathBuf {
    state_dir.join(ROLLOUT_FILE)
}

/// Derive a stable rollout id from the strategy expression, the ordered
/// host list, and the start timestamp, mirroring the teacher's
/// `compute_plan_id`.
pub fn compute_rollout_id(strategy_expression: &str, hosts: &[HostDescriptor], started_at_rfc3339: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(strategy_expression.as_bytes());
    hasher.update(b"\n");
    for host in hosts {
        hasher.update(host.key().as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(started_at_rfc3339.as_bytes());
    hex::encode(hasher.finalize())
}

/// Load the rollout record from `state_dir`, if one exists.
pub fn load_rollout(state_dir: &Path) -> Result<Option<RolloutRecord>> {
    let path = rollout_path(state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("failed to read rollout record {}", path.display()))?;
    let record: RolloutRecord = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse rollout record JSON {}", path.display()))?;
    Ok(Some(record))
}

/// Atomically persist `record` to `state_dir`.
pub fn save_rollout(state_dir: &Path, record: &RolloutRecord) -> Result<()> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

    let path = rollout_path(state_dir);
    let tmp_path = path.with_extension("tmp");
    let json = serde_json::to_string_pretty(record).context("failed to serialize rollout record")?;
    fs::write(&tmp_path, json)
        .with_context(|| format!("failed to write rollout tmp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &path)
        .with_context(|| format!("failed to rename rollout record to {}", path.display()))?;
    Ok(())
}

/// Remove a completed rollout's record, so a future `deploy` starts fresh
/// rather than being mistaken for a resumable one.
pub fn clear_rollout(state_dir: &Path) -> Result<()> {
    let path = rollout_path(state_dir);
    if path.exists() {
        fs::remove_file(&path)
            .with_context(|| format!("failed to remove rollout record {}", path.display()))?;
    }
    Ok(())
}

/// Start a fresh [`RolloutRecord`] with a freshly computed id, or resume
/// the one already on disk when `resume` is set and a record exists.
pub fn start_or_resume(
    state_dir: &Path,
    strategy: DeploymentStrategy,
    hosts: Vec<HostDescriptor>,
    resume: bool,
) -> Result<RolloutRecord> {
    if resume {
        if let Some(existing) = load_rollout(state_dir)? {
            return Ok(existing);
        }
    }

    let started_at = chrono::Utc::now();
    let rollout_id = compute_rollout_id(&strategy.display_name(), &hosts, &started_at.to_rfc3339());
    let mut record = RolloutRecord::new(rollout_id, strategy, hosts);
    record.started_at = started_at;
    save_rollout(state_dir, &record)?;
    Ok(record)
}
