//! # Types
//!
//! Core domain types for wharf: archive entries, diffs, host descriptors,
//! deployment strategies, preflight results, and the rollout record.
//!
//! - [`EntryIndex`] / [`Diff`] - the archive diff engine's data model
//! - [`HostDescriptor`] / [`DeploymentStrategy`] - fleet + batching inputs
//! - [`HostPreflightResult`] - per-host preflight output, coordinator input
//! - [`DeploymentSession`] / [`DeploymentStatus`] - server-side state
//! - [`RolloutRecord`] / [`RolloutEvent`] - the CLI's resumable rollout log
//!
//! ## Serialization
//!
//! Most types implement `Serialize`/`Deserialize` from `serde`, for
//! persistence to disk and for the agent's JSON wire format. Durations use
//! [`wharf_duration`]'s helpers so they accept either humantime strings or
//! millisecond integers.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use wharf_duration::{deserialize_duration, serialize_duration};

/// A named leaf within an archive: a forward-slash-separated path and its
/// SHA-256 content digest (lower-hex). Directory entries are excluded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: String,
    pub digest: String,
}

/// A mapping from entry path to hex digest. Path is a primary key; an
/// empty index represents "no archive installed."
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct EntryIndex(pub BTreeMap<String, String>);

impl EntryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = ArchiveEntry>) -> Self {
        let mut map = BTreeMap::new();
        for entry in entries {
            // Archive semantics: last-writer-wins on path collision.
            map.insert(entry.path, entry.digest);
        }
        Self(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Diff this index (treated as local) against `remote`.
    pub fn diff(&self, remote: &EntryIndex) -> Diff {
        let mut changed: Vec<String> = self
            .0
            .iter()
            .filter(|(path, digest)| remote.0.get(*path) != Some(*digest))
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();

        let mut deleted: Vec<String> = remote
            .0
            .keys()
            .filter(|path| !self.0.contains_key(*path))
            .cloned()
            .collect();
        deleted.sort();

        Diff { changed, deleted }
    }
}

/// The pair (changed paths, deleted paths) between two entry indexes.
/// Invariant: `changed` and `deleted` are disjoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diff {
    pub changed: Vec<String>,
    pub deleted: Vec<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// A target application server: address, agent port, and the optional
/// name the load balancers use to identify it. Used as a map key in
/// per-host result maps, so it derives `Ord`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostDescriptor {
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balancer_server_name: Option<String>,
}

impl HostDescriptor {
    /// `"address:port"`, the stable key used in result maps and rollout records.
    pub fn key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn base_url(&self, scheme: &str) -> String {
        format!("{}://{}:{}", scheme, self.address, self.port)
    }
}

impl std::fmt::Display for HostDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// A batch's host count: a fixed positive integer, or the sentinel
/// "rest" meaning "all remaining hosts." `Rest` may only appear as the
/// last batch in a strategy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchCount {
    Fixed(u32),
    Rest,
}

/// One batch in a [`DeploymentStrategy`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batch {
    pub count: BatchCount,
}

/// An ordered sequence of batches parsed from a strategy expression.
/// `is_canary` is true iff there is more than one batch; canary
/// strategies abort subsequent batches on any failure in a batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentStrategy {
    pub batches: Vec<Batch>,
    pub is_canary: bool,
    /// The original expression, e.g. `"1+R"`, as given by the operator.
    pub expression: String,
}

impl DeploymentStrategy {
    /// The original expression prefixed with `"canary (...)"` for canary strategies.
    pub fn display_name(&self) -> String {
        if self.is_canary {
            format!("canary ({})", self.expression)
        } else {
            self.expression.clone()
        }
    }
}

/// Summary of a host's diff against the local archive, computed during preflight.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub changed_count: usize,
    pub deleted_count: usize,
    pub bytes_to_upload: u64,
    pub is_full_upload: bool,
}

/// Per-host result of the preflight pipeline (§4.6): the coordinator's input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostPreflightResult {
    pub host: HostDescriptor,
    pub reachable: bool,
    pub agent_version: Option<String>,
    pub app_server_running: bool,
    pub diff: Diff,
    pub summary: DiffSummary,
    pub error: Option<String>,
}

/// One file payload accumulated in a chunked-upload [`DeploymentSession`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionFile {
    pub path: String,
    /// Base64-encoded bytes, matching the inline `/deploy` wire format.
    pub content_b64: String,
}

/// Server-side accumulator for a chunked upload. At most 10 concurrent
/// sessions; an eleventh evicts the oldest by creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentSession {
    pub id: String,
    pub files: Vec<SessionFile>,
    pub deletions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub expected_files: Option<usize>,
}

impl DeploymentSession {
    pub fn new(id: String, now: DateTime<Utc>, expected_files: Option<usize>) -> Self {
        Self {
            id,
            files: Vec::new(),
            deletions: Vec::new(),
            created_at: now,
            expected_files,
        }
    }
}

/// Outcome of one reconciler operation (`apply` or `full_replace`), also
/// the shape of `lastResult` on the agent's status record. `rename_all =
/// "camelCase"` because this is a wire type shared verbatim with the
/// agent's JSON responses (§6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub success: bool,
    pub files_changed: usize,
    pub files_deleted: usize,
    pub deployment_time_ms: u64,
    pub deployed_applications: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Server-side single-writer deployment status record (§4.11). Wire shape
/// for `GET /deploy/status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub deploying: bool,
    pub deployment_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub current_step: Option<String>,
    pub last_result: Option<DeployResult>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// Classification of a deploy failure: whether the coordinator should retry it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Retryable,
    Permanent,
    Ambiguous,
}

/// Error kinds the rollout coordinator and preflight pipeline raise (§7).
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeployError {
    #[error("host unreachable after retries")]
    Unreachable,
    #[error("hash fetch failed: {message}")]
    HashFetchFailed { message: String },
    #[error("diff analysis failed: {message}")]
    AnalysisFailed { message: String },
    #[error("deployment in progress")]
    DeployInProgress,
    #[error("deployment request timed out")]
    DeployTimeout,
    #[error("deployment failed: {message}")]
    DeployFailed { message: String },
    #[error("drain failed: {details}")]
    DrainFailed { details: String },
    #[error("chunked upload session expired")]
    SessionExpired,
    #[error("transport error: {message}")]
    Transport { message: String },
}

impl DeployError {
    /// User-facing status each host ends in: succeeded / failed / skipped / unreachable.
    pub fn terminal_label(&self) -> &'static str {
        match self {
            DeployError::Unreachable => "unreachable",
            _ => "failed",
        }
    }
}

/// The per-host terminal state a rollout coordinator reports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostOutcome {
    Succeeded,
    Failed,
    Skipped,
    Unreachable,
}

/// Aggregate result of one rollout coordinator run (§4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutSummary {
    pub results: BTreeMap<String, HostOutcome>,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub aborted: bool,
    pub failed_batch: Option<usize>,
}

// ---------------------------------------------------------------------
// [ADDED] Rollout record / event: resumable CLI-side bookkeeping.
// ---------------------------------------------------------------------

/// Per-host state within a persisted [`RolloutRecord`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HostRolloutState {
    Pending,
    Succeeded,
    Failed { reason: String },
    Skipped { reason: String },
}

/// A persisted, resumable snapshot of a rollout run. The rollout id is a
/// SHA-256 hash of the strategy expression, the ordered host list, and
/// the plan timestamp, mirroring the teacher's `compute_plan_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutRecord {
    pub rollout_id: String,
    pub strategy: DeploymentStrategy,
    pub hosts: Vec<HostDescriptor>,
    pub host_states: BTreeMap<String, HostRolloutState>,
    pub started_at: DateTime<Utc>,
}

impl RolloutRecord {
    pub fn new(rollout_id: String, strategy: DeploymentStrategy, hosts: Vec<HostDescriptor>) -> Self {
        let host_states = hosts
            .iter()
            .map(|h| (h.key(), HostRolloutState::Pending))
            .collect();
        Self {
            rollout_id,
            strategy,
            hosts,
            host_states,
            started_at: Utc::now(),
        }
    }

    /// Hosts that still need a deploy attempt: `Pending`, or `Failed`/`Skipped`
    /// unless the caller passed `--no-retry-failed`.
    pub fn hosts_to_retry(&self, retry_failed: bool) -> Vec<HostDescriptor> {
        self.hosts
            .iter()
            .filter(|h| match self.host_states.get(&h.key()) {
                Some(HostRolloutState::Succeeded) => false,
                Some(HostRolloutState::Failed { .. }) | Some(HostRolloutState::Skipped { .. }) => {
                    retry_failed
                }
                _ => true,
            })
            .cloned()
            .collect()
    }

    pub fn is_fully_succeeded(&self) -> bool {
        self.host_states
            .values()
            .all(|s| matches!(s, HostRolloutState::Succeeded))
    }
}

/// Kinds of entries written to the append-only rollout event log (§4.13).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RolloutEventType {
    RolloutStarted { strategy: String, host_count: usize },
    BatchStarted { batch_index: usize, size: usize },
    HostDrained,
    HostUploaded { files_changed: usize, files_deleted: usize, is_full_upload: bool },
    HostSucceeded,
    HostFailed { class: ErrorClass, message: String },
    HostSkipped { reason: String },
    RolloutFinished { successful: usize, failed: usize, skipped: usize, aborted: bool },
}

/// One entry in the rollout's JSONL event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RolloutEvent {
    pub timestamp: DateTime<Utc>,
    /// `None` for rollout-level events (started/finished); set for per-host events.
    pub host: Option<String>,
    pub event_type: RolloutEventType,
}

impl RolloutEvent {
    pub fn now(host: Option<String>, event_type: RolloutEventType) -> Self {
        Self { timestamp: Utc::now(), host, event_type }
    }
}

// ---------------------------------------------------------------------
// Duration-bearing config fragments shared between CLI flags and
// `.wharf.toml` (full config struct lives in `wharf-core::config`).
// ---------------------------------------------------------------------

/// Timeout knobs from §5/§6: agent request timeout, deploy timeout, and
/// status-poll interval/ceiling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub agent: Duration,
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub deployment: Duration,
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub status_poll_interval: Duration,
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    pub status_poll_max_wait: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            agent: Duration::from_millis(10_000),
            deployment: Duration::from_millis(120_000),
            status_poll_interval: Duration::from_millis(2_000),
            status_poll_max_wait: Duration::from_millis(180_000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_index_diff_s1_scenario() {
        let remote = EntryIndex::from_entries([
            ArchiveEntry { path: "a".into(), digest: "H1".into() },
            ArchiveEntry { path: "b".into(), digest: "H2".into() },
        ]);
        let local = EntryIndex::from_entries([
            ArchiveEntry { path: "a".into(), digest: "H1".into() },
            ArchiveEntry { path: "b".into(), digest: "H3".into() },
            ArchiveEntry { path: "c".into(), digest: "H4".into() },
        ]);

        let diff = local.diff(&remote);
        assert_eq!(diff.changed, vec!["b".to_string(), "c".to_string()]);
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn diff_against_empty_remote_is_all_changed() {
        let local = EntryIndex::from_entries([ArchiveEntry { path: "a".into(), digest: "H1".into() }]);
        let remote = EntryIndex::new();
        let diff = local.diff(&remote);
        assert_eq!(diff.changed, vec!["a".to_string()]);
        assert!(diff.deleted.is_empty());
    }

    #[test]
    fn diff_of_empty_local_against_remote_is_all_deletions() {
        let local = EntryIndex::new();
        let remote = EntryIndex::from_entries([ArchiveEntry { path: "a".into(), digest: "H1".into() }]);
        let diff = local.diff(&remote);
        assert!(diff.changed.is_empty());
        assert_eq!(diff.deleted, vec!["a".to_string()]);
    }

    #[test]
    fn diff_of_identical_indexes_is_empty() {
        let idx = EntryIndex::from_entries([ArchiveEntry { path: "a".into(), digest: "H1".into() }]);
        let diff = idx.diff(&idx.clone());
        assert!(diff.is_empty());
    }

    #[test]
    fn last_writer_wins_on_path_collision() {
        let idx = EntryIndex::from_entries([
            ArchiveEntry { path: "a".into(), digest: "H1".into() },
            ArchiveEntry { path: "a".into(), digest: "H2".into() },
        ]);
        assert_eq!(idx.get("a"), Some("H2"));
    }

    #[test]
    fn host_descriptor_key_and_display() {
        let host = HostDescriptor {
            address: "10.0.1.10".into(),
            port: 7070,
            balancer_server_name: Some("app1".into()),
        };
        assert_eq!(host.key(), "10.0.1.10:7070");
        assert_eq!(host.to_string(), "10.0.1.10:7070");
    }

    #[test]
    fn deployment_strategy_display_name_marks_canary() {
        let canary = DeploymentStrategy {
            batches: vec![Batch { count: BatchCount::Fixed(1) }, Batch { count: BatchCount::Rest }],
            is_canary: true,
            expression: "1+R".into(),
        };
        assert_eq!(canary.display_name(), "canary (1+R)");

        let plain = DeploymentStrategy {
            batches: vec![Batch { count: BatchCount::Rest }],
            is_canary: false,
            expression: "parallel".into(),
        };
        assert_eq!(plain.display_name(), "parallel");
    }

    #[test]
    fn rollout_record_retries_only_non_succeeded() {
        let hosts = vec![
            HostDescriptor { address: "h1".into(), port: 1, balancer_server_name: None },
            HostDescriptor { address: "h2".into(), port: 1, balancer_server_name: None },
        ];
        let strategy = DeploymentStrategy {
            batches: vec![Batch { count: BatchCount::Fixed(1) }],
            is_canary: false,
            expression: "sequential".into(),
        };
        let mut record = RolloutRecord::new("r1".into(), strategy, hosts.clone());
        record
            .host_states
            .insert(hosts[0].key(), HostRolloutState::Succeeded);

        let retry = record.hosts_to_retry(false);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].key(), hosts[1].key());
        assert!(!record.is_fully_succeeded());
    }

    #[test]
    fn deploy_error_serde_tagged_representation() {
        let err = DeployError::DeployFailed { message: "boom".into() };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"kind\":\"deploy_failed\""));
        let back: DeployError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn timeout_config_defaults_match_spec() {
        let cfg = TimeoutConfig::default();
        assert_eq!(cfg.agent, Duration::from_millis(10_000));
        assert_eq!(cfg.deployment, Duration::from_millis(120_000));
        assert_eq!(cfg.status_poll_interval, Duration::from_millis(2_000));
        assert_eq!(cfg.status_poll_max_wait, Duration::from_millis(180_000));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn diff_changed_and_deleted_are_disjoint(
                local_paths in proptest::collection::vec("[a-c]", 0..5),
                remote_paths in proptest::collection::vec("[a-c]", 0..5),
            ) {
                let local = EntryIndex::from_entries(
                    local_paths.iter().map(|p| ArchiveEntry { path: p.clone(), digest: "L".into() }),
                );
                let remote = EntryIndex::from_entries(
                    remote_paths.iter().map(|p| ArchiveEntry { path: p.clone(), digest: "R".into() }),
                );
                let diff = local.diff(&remote);
                let changed: std::collections::HashSet<_> = diff.changed.iter().collect();
                let deleted: std::collections::HashSet<_> = diff.deleted.iter().collect();
                prop_assert!(changed.is_disjoint(&deleted));
            }
        }
    }
}
