//! Preflight pipeline (spec.md §4.6): for each host, reachability, an
//! optional soft version check, and a diff against the local entry index,
//! fully fanned out in parallel. No host's failure fails the pipeline as
//! a whole — each host's outcome lands in its own slot of the result map.
//!
//! Per the design note in SPEC_FULL.md §9, this follows the teacher's
//! `engine_parallel` model: one OS thread per in-flight host rather than
//! an async runtime, joined once every host has resolved.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use wharf_types::{DiffSummary, EntryIndex, HostDescriptor, HostPreflightResult, TimeoutConfig};
use wharf_retry::RetryStrategyConfig;

use crate::archive;
use crate::transport::AgentClient;

/// Caller-supplied inputs held constant across every host in a run.
pub struct PreflightInput {
    pub hosts: Vec<HostDescriptor>,
    pub local_index: EntryIndex,
    pub local_archive_path: PathBuf,
    pub force: bool,
    pub skip_version_check: bool,
    pub retry_config: RetryStrategyConfig,
    pub timeouts: TimeoutConfig,
}

/// Aggregate output of one preflight run (§4.6).
#[derive(Debug, Clone, Default)]
pub struct PreflightReport {
    pub reachable: Vec<HostDescriptor>,
    pub hosts_with_updates: Vec<HostDescriptor>,
    pub results: BTreeMap<String, HostPreflightResult>,
}

/// Run the preflight pipeline: one thread per host, joined at the end.
/// Execution order across hosts is unspecified (§4.6).
pub fn run_preflight(input: &PreflightInput) -> PreflightReport {
    let local_index = Arc::new(input.local_index.clone());
    let local_archive_path = Arc::new(input.local_archive_path.clone());

    let mut handles = Vec::with_capacity(input.hosts.len());
    for host in &input.hosts {
        let host = host.clone();
        let local_index = Arc::clone(&local_index);
        let local_archive_path = Arc::clone(&local_archive_path);
        let retry_config = input.retry_config.clone();
        let timeouts = input.timeouts.clone();
        let force = input.force;
        let skip_version_check = input.skip_version_check;

        handles.push(thread::spawn(move || {
            preflight_one(&host, &local_index, &local_archive_path, force, skip_version_check, retry_config, &timeouts)
        }));
    }

    let mut report = PreflightReport::default();
    for handle in handles {
        let result = handle.join().expect("preflight host thread panicked");
        let key = result.host.key();
        if result.reachable {
            report.reachable.push(result.host.clone());
            if !result.diff.is_empty() || result.summary.is_full_upload {
                report.hosts_with_updates.push(result.host.clone());
            }
        }
        report.results.insert(key, result);
    }

    report
}

fn preflight_one(
    host: &HostDescriptor,
    local_index: &EntryIndex,
    local_archive_path: &Path,
    force: bool,
    skip_version_check: bool,
    retry_config: RetryStrategyConfig,
    timeouts: &TimeoutConfig,
) -> HostPreflightResult {
    let client = match AgentClient::new(host, retry_config, timeouts) {
        Ok(c) => c,
        Err(e) => return unreachable_result(host, &e.to_string()),
    };

    // Step 1: reachability + version probe.
    let health = match client.health() {
        Ok(h) => h,
        Err(_) => return unreachable_result(host, "host did not respond to /health after retries"),
    };

    // Step 2: soft, non-gating version check.
    if !skip_version_check {
        // A transport error or a 404 (agent predates the endpoint) is
        // advisory only; preflight proceeds to analysis either way
        // (SPEC_FULL.md §9 open question, resolved "yes, proceed").
        let _ = client.plugin_versions();
    }

    // Step 3: analysis - fetch remote hashes and diff against local.
    let (diff, is_full_upload, analysis_error) = match client.hashes() {
        Ok(resp) if !force && resp.status != "no_war" && !resp.hashes.is_empty() => {
            let remote_index = EntryIndex::from_entries(resp.hashes.into_iter().map(|(path, digest)| {
                wharf_types::ArchiveEntry { path, digest }
            }));
            (local_index.diff(&remote_index), false, None)
        }
        Ok(_) => {
            // Remote reports no installed archive, or the caller forced a
            // full deploy: every local path is "changed", nothing deleted.
            let changed: Vec<String> = local_index.paths().map(str::to_string).collect();
            (wharf_types::Diff { changed, deleted: vec![] }, true, None)
        }
        Err(e) => {
            // HashFetchFailed never fails the host outright: fall back to
            // a full upload with a recorded warning (§4.6, §7).
            let changed: Vec<String> = local_index.paths().map(str::to_string).collect();
            (wharf_types::Diff { changed, deleted: vec![] }, true, Some(e.to_string()))
        }
    };

    let changed_set: std::collections::HashSet<String> = diff.changed.iter().cloned().collect();
    let bytes_to_upload = archive::sum_entry_sizes(local_archive_path, &changed_set).unwrap_or(0);

    let summary = DiffSummary {
        changed_count: diff.changed.len(),
        deleted_count: diff.deleted.len(),
        bytes_to_upload,
        is_full_upload,
    };

    HostPreflightResult {
        host: host.clone(),
        reachable: true,
        agent_version: Some(health.agent_version),
        app_server_running: health.app_server_running,
        diff,
        summary,
        error: analysis_error,
    }
}

fn unreachable_result(host: &HostDescriptor, message: &str) -> HostPreflightResult {
    HostPreflightResult {
        host: host.clone(),
        reachable: false,
        agent_version: None,
        app_server_running: false,
        diff: wharf_types::Diff::default(),
        summary: DiffSummary::default(),
        error: Some(message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use wharf_types::ArchiveEntry;
    use zip::write::{FileOptions, SimpleFileOptions, ZipWriter};

    fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        let options: SimpleFileOptions = FileOptions::default();
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn unreachable_host_is_recorded_but_does_not_panic() {
        let td = tempfile::tempdir().unwrap();
        let archive_path = td.path().join("app.war");
        write_archive(&archive_path, &[("a.txt", b"hi")]);

        let host = HostDescriptor { address: "127.0.0.1".into(), port: 1, balancer_server_name: None };
        let local_index = EntryIndex::from_entries([ArchiveEntry { path: "a.txt".into(), digest: "H1".into() }]);

        let input = PreflightInput {
            hosts: vec![host.clone()],
            local_index,
            local_archive_path: archive_path,
            force: false,
            skip_version_check: true,
            retry_config: RetryStrategyConfig {
                strategy: wharf_retry::RetryStrategyType::Constant,
                max_attempts: 1,
                base_delay: std::time::Duration::from_millis(1),
                max_delay: std::time::Duration::from_millis(1),
                jitter: 0.0,
            },
            timeouts: TimeoutConfig {
                agent: std::time::Duration::from_millis(200),
                ..TimeoutConfig::default()
            },
        };

        let report = run_preflight(&input);
        assert!(report.reachable.is_empty());
        let result = report.results.get(&host.key()).unwrap();
        assert!(!result.reachable);
        assert_eq!(result.error.as_deref(), Some("host did not respond to /health after retries"));
    }

    #[test]
    fn empty_host_list_produces_empty_report() {
        let input = PreflightInput {
            hosts: vec![],
            local_index: EntryIndex::new(),
            local_archive_path: PathBuf::from("unused.war"),
            force: false,
            skip_version_check: true,
            retry_config: RetryStrategyConfig::default(),
            timeouts: TimeoutConfig::default(),
        };
        let report = run_preflight(&input);
        assert!(report.results.is_empty());
        assert!(report.reachable.is_empty());
    }
}
