//! Rollout coordinator (spec.md §4.7) and single-host deployment (§4.8).
//!
//! The coordinator walks a parsed strategy's batches over an ordered host
//! list, running each batch concurrently (one thread per host, joined
//! before the next batch starts) and aborting the remaining hosts on the
//! first failure of a canary batch. Single-host deployment drives drain,
//! upload (inline / chunked / full, depending on the diff), the 409/
//! timeout-to-poll fallback, and ready-on-success.
//!
//! Grounded on the teacher's `engine_parallel::run_publish_level`
//! (chunked thread-per-task batches) for the concurrency shape.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use base64::Engine as _;
use chrono::Utc;
use wharf_retry::RetryStrategyConfig;
use wharf_types::{
    BatchCount, DeployError, DeploymentStrategy, Diff, HostDescriptor, HostOutcome, RolloutSummary, TimeoutConfig,
};

use crate::archive;
use crate::config::BalancerConfig;
use crate::drain::{self, ServerState};
use crate::transport::{AgentClient, ChunkRequest, DeployOutcome, InlineDeployRequest, InlineFile};

/// Maximum number of entries uploaded per request of the chunked protocol (§4.10).
pub const FILES_PER_CHUNK: usize = 50;

/// Everything [`deploy_one_host`] needs for one host's deployment.
pub struct HostDeployInput<'a> {
    pub host: &'a HostDescriptor,
    pub diff: &'a Diff,
    pub is_full_upload: bool,
    pub local_archive_path: &'a Path,
    pub balancer: Option<&'a BalancerConfig>,
    pub retry_config: RetryStrategyConfig,
    pub timeouts: &'a TimeoutConfig,
}

/// Run the rollout coordinator: walk `strategy`'s batches over `hosts`,
/// deploying each batch concurrently via `deploy_fn` (§4.7).
pub fn run_rollout<F>(strategy: &DeploymentStrategy, hosts: &[HostDescriptor], deploy_fn: F) -> RolloutSummary
where
    F: Fn(&HostDescriptor) -> Result<(), DeployError> + Send + Sync + 'static,
{
    let deploy_fn = Arc::new(deploy_fn);
    let mut summary = RolloutSummary::default();
    let num_batches = strategy.batches.len();

    if num_batches == 0 {
        return summary;
    }

    let mut host_idx = 0usize;
    let mut batch_idx = 0usize;

    while host_idx < hosts.len() {
        let batch = if strategy.is_canary {
            match strategy.batches.get(batch_idx) {
                Some(b) => *b,
                None => break,
            }
        } else {
            strategy.batches[batch_idx % num_batches]
        };

        let remaining = hosts.len() - host_idx;
        let size = match batch.count {
            BatchCount::Rest => remaining,
            BatchCount::Fixed(n) => (n as usize).min(remaining),
        };

        let batch_hosts = &hosts[host_idx..host_idx + size];
        host_idx += size;

        let mut handles = Vec::with_capacity(batch_hosts.len());
        for host in batch_hosts {
            let host = host.clone();
            let deploy_fn = Arc::clone(&deploy_fn);
            handles.push(thread::spawn(move || {
                let result = deploy_fn(&host);
                (host, result)
            }));
        }

        let mut batch_failed = false;
        for handle in handles {
            let (host, result) = handle.join().expect("host deployment thread panicked");
            match result {
                Ok(()) => {
                    summary.results.insert(host.key(), HostOutcome::Succeeded);
                    summary.successful += 1;
                }
                Err(DeployError::Unreachable) => {
                    summary.results.insert(host.key(), HostOutcome::Unreachable);
                    summary.failed += 1;
                    batch_failed = true;
                }
                Err(_) => {
                    summary.results.insert(host.key(), HostOutcome::Failed);
                    summary.failed += 1;
                    batch_failed = true;
                }
            }
        }

        if strategy.is_canary && batch_failed && host_idx < hosts.len() {
            for host in &hosts[host_idx..] {
                summary.results.insert(host.key(), HostOutcome::Skipped);
                summary.skipped += 1;
            }
            summary.aborted = true;
            summary.failed_batch = Some(batch_idx + 1);
            break;
        }

        batch_idx += 1;
    }

    summary
}

/// Deploy to a single host end-to-end: drain, upload, await the result,
/// ready on success (§4.8). Drained hosts stay drained on failure — an
/// operator concern (§9 open question).
pub fn deploy_one_host(input: &HostDeployInput) -> Result<(), DeployError> {
    let drained = match input.balancer {
        Some(balancer) if drain::resolve_server_name(balancer, input.host).is_some() => {
            let outcome = drain::set_server_state(balancer, input.host, ServerState::Drain);
            if !outcome.success {
                return Err(DeployError::DrainFailed { details: outcome.failure_summary() });
            }
            true
        }
        _ => false,
    };

    let deploy_result = upload_and_await(input);

    if drained && deploy_result.is_ok() {
        if let Some(balancer) = input.balancer {
            let ready = drain::set_server_state(balancer, input.host, ServerState::Ready);
            if !ready.success {
                return Err(DeployError::DrainFailed { details: ready.failure_summary() });
            }
        }
    }

    deploy_result
}

fn upload_and_await(input: &HostDeployInput) -> Result<(), DeployError> {
    let client = AgentClient::new(input.host, input.retry_config.clone(), input.timeouts)
        .map_err(|e| DeployError::Transport { message: e.to_string() })?;
    let local_start = Utc::now();

    let outcome = if input.is_full_upload {
        let archive_bytes =
            std::fs::read(input.local_archive_path).map_err(|e| DeployError::Transport { message: e.to_string() })?;
        client.deploy_upload(archive_bytes)?
    } else if input.diff.changed.len() > FILES_PER_CHUNK {
        deploy_chunked(&client, input)?
    } else {
        let entries = archive::read_entries(input.local_archive_path, &input.diff.changed)
            .map_err(|e| DeployError::Transport { message: e.to_string() })?;
        let files = entries.into_iter().map(to_inline_file).collect();
        let body = InlineDeployRequest { files, deletions: input.diff.deleted.clone() };
        client.deploy_inline(&body)?
    };

    match outcome {
        DeployOutcome::Completed(result) if result.success => Ok(()),
        DeployOutcome::Completed(result) => Err(DeployError::DeployFailed {
            message: result.message.unwrap_or_else(|| "deploy failed".to_string()),
        }),
        DeployOutcome::InProgress => client.poll_deploy_status(local_start).map(|_| ()),
    }
}

fn deploy_chunked(client: &AgentClient, input: &HostDeployInput) -> Result<DeployOutcome, DeployError> {
    let entries = archive::read_entries(input.local_archive_path, &input.diff.changed)
        .map_err(|e| DeployError::Transport { message: e.to_string() })?;
    let files: Vec<InlineFile> = entries.into_iter().map(to_inline_file).collect();

    let chunks: Vec<Vec<InlineFile>> = files.chunks(FILES_PER_CHUNK).map(<[InlineFile]>::to_vec).collect();
    let total_chunks = chunks.len();
    let mut session_id: Option<String> = None;

    for (i, chunk) in chunks.into_iter().enumerate() {
        let is_last = i + 1 == total_chunks;
        let req = ChunkRequest {
            session_id: session_id.clone(),
            files: chunk,
            deletions: if i == 0 { Some(input.diff.deleted.clone()) } else { None },
            expected_files: if i == 0 { Some(input.diff.changed.len()) } else { None },
            commit: if is_last { Some(true) } else { None },
        };

        let resp = match client.deploy_chunk(&req) {
            Ok(resp) => resp,
            Err(e) => {
                if let Some(id) = &session_id {
                    let _ = client.cancel_chunk(id);
                }
                return Err(e);
            }
        };
        session_id = Some(resp.session_id);

        if is_last {
            return match resp.result {
                Some(result) if result.success => Ok(DeployOutcome::Completed(result)),
                Some(result) => Err(DeployError::DeployFailed {
                    message: result.message.unwrap_or_else(|| "deploy failed".to_string()),
                }),
                None if resp.committed => Ok(DeployOutcome::InProgress),
                None => Err(DeployError::Transport { message: "final chunk did not commit".to_string() }),
            };
        }
    }

    Ok(DeployOutcome::InProgress)
}

fn to_inline_file((path, bytes): (String, Vec<u8>)) -> InlineFile {
    InlineFile { path, content_b64: base64::engine::general_purpose::STANDARD.encode(bytes) }
}

/// Classify a deploy failure's message text into a retry-worthiness class,
/// mirroring the teacher's `classify_cargo_failure` pattern matcher. Used by
/// the rollout coordinator's caller to decide whether a `failed` host should
/// be retried on `--resume` and to annotate `HostFailed` events (§7).
pub fn classify_deploy_failure(message: &str) -> (wharf_types::ErrorClass, String) {
    let hay = message.to_lowercase();

    let retryable_patterns = [
        "timeout",
        "timed out",
        "connection reset",
        "connection refused",
        "connection closed",
        "unreachable",
        "dns",
        "tls",
        "temporarily unavailable",
        "502",
        "503",
        "504",
        "in progress",
    ];
    if retryable_patterns.iter().any(|p| hay.contains(p)) {
        return (wharf_types::ErrorClass::Retryable, "transient failure (retryable)".into());
    }

    let permanent_patterns = ["drain failed", "no balancer mapping", "session expired", "invalid"];
    if permanent_patterns.iter().any(|p| hay.contains(p)) {
        return (wharf_types::ErrorClass::Permanent, "non-transient failure (not retryable)".into());
    }

    (wharf_types::ErrorClass::Ambiguous, "unclassified failure".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::parse_strategy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn host(n: u16) -> HostDescriptor {
        HostDescriptor { address: format!("10.0.1.{n}"), port: 7070, balancer_server_name: None }
    }

    #[test]
    fn sequential_strategy_deploys_one_host_per_batch() {
        let strategy = parse_strategy("sequential").unwrap();
        let hosts = vec![host(10), host(11), host(12)];
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = Arc::clone(&order);

        let summary = run_rollout(&strategy, &hosts, move |h| {
            order_clone.lock().unwrap().push(h.key());
            Ok(())
        });

        assert_eq!(summary.successful, 3);
        assert_eq!(summary.failed, 0);
        assert!(!summary.aborted);
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[test]
    fn parallel_strategy_deploys_all_hosts_in_one_batch() {
        let strategy = parse_strategy("parallel").unwrap();
        let hosts = vec![host(10), host(11), host(12)];
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let concurrent_clone = Arc::clone(&concurrent);
        let peak_clone = Arc::clone(&peak);

        let summary = run_rollout(&strategy, &hosts, move |_h| {
            let now = concurrent_clone.fetch_add(1, Ordering::SeqCst) + 1;
            peak_clone.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(10));
            concurrent_clone.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(summary.successful, 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn canary_strategy_skips_remaining_hosts_on_first_batch_failure() {
        let strategy = parse_strategy("1+R").unwrap();
        let hosts = vec![host(10), host(11), host(12), host(13)];

        let summary = run_rollout(&strategy, &hosts, move |h| {
            if h.address == "10.0.1.10" {
                Err(DeployError::DeployFailed { message: "boom".into() })
            } else {
                Ok(())
            }
        });

        assert!(summary.aborted);
        assert_eq!(summary.failed_batch, Some(1));
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.successful, 0);
    }

    #[test]
    fn canary_strategy_proceeds_past_batch_when_first_batch_succeeds() {
        let strategy = parse_strategy("1+R").unwrap();
        let hosts = vec![host(10), host(11), host(12)];

        let summary = run_rollout(&strategy, &hosts, |h| {
            if h.address == "10.0.1.11" {
                Err(DeployError::DeployFailed { message: "boom".into() })
            } else {
                Ok(())
            }
        });

        assert!(!summary.aborted);
        assert_eq!(summary.successful, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 0);
    }

    #[test]
    fn non_canary_strategy_ignores_failures_in_batch() {
        let strategy = parse_strategy("2").unwrap();
        let hosts = vec![host(10), host(11), host(12), host(13)];

        let summary = run_rollout(&strategy, &hosts, move |h| {
            if h.address == "10.0.1.10" {
                Err(DeployError::DeployFailed { message: "boom".into() })
            } else {
                Ok(())
            }
        });

        assert!(!summary.aborted);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.successful, 3);
        assert_eq!(summary.skipped, 0);
    }

    #[test]
    fn empty_host_list_produces_empty_summary() {
        let strategy = parse_strategy("sequential").unwrap();
        let summary = run_rollout(&strategy, &[], |_h| Ok(()));
        assert_eq!(summary.successful, 0);
        assert!(summary.results.is_empty());
    }

    #[test]
    fn classify_deploy_failure_covers_retryable_permanent_and_ambiguous() {
        let retryable = classify_deploy_failure("status 504: gateway timeout");
        assert_eq!(retryable.0, wharf_types::ErrorClass::Retryable);

        let permanent = classify_deploy_failure("drain failed: lb1: exit code 1");
        assert_eq!(permanent.0, wharf_types::ErrorClass::Permanent);

        let ambiguous = classify_deploy_failure("the application server rejected the archive");
        assert_eq!(ambiguous.0, wharf_types::ErrorClass::Ambiguous);
    }
}
