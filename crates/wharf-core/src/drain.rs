//! Drain protocol client (spec.md §4.9, §6 "Balancer protocol"): sets a
//! single application host's backend to `drain` or `ready` on every
//! configured load balancer, over a remote shell that pipes a one-line
//! command into a local HAProxy admin socket.
//!
//! The operation succeeds only if *every* balancer host reports success;
//! a partial drain would leave the load-balancer fleet inconsistent
//! (§4.9). Balancer hosts are contacted concurrently, one thread each,
//! mirroring the thread-per-task model used by the preflight pipeline
//! and the rollout coordinator.

use std::thread;
use std::time::Duration;

use wharf_process::run_command_with_timeout;
use wharf_types::HostDescriptor;

use crate::config::BalancerConfig;

/// The two states the balancer protocol supports (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Drain,
    Ready,
}

impl ServerState {
    fn as_str(self) -> &'static str {
        match self {
            ServerState::Drain => "drain",
            ServerState::Ready => "ready",
        }
    }
}

/// One balancer host's result.
#[derive(Debug, Clone)]
pub struct BalancerHostResult {
    pub balancer_host: String,
    pub success: bool,
    pub message: Option<String>,
}

/// Aggregate outcome of a drain/ready/connectivity-check operation:
/// success only when every balancer host succeeded (§4.9, §8 property 8).
#[derive(Debug, Clone)]
pub struct DrainOutcome {
    pub success: bool,
    pub results: Vec<BalancerHostResult>,
}

impl DrainOutcome {
    /// A human-readable aggregate failure listing each balancer's result,
    /// used as the `DrainFailed` error detail (§7).
    pub fn failure_summary(&self) -> String {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| format!("{}: {}", r.balancer_host, r.message.as_deref().unwrap_or("failed")))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Look up the server name the balancers use to identify `host`: the
/// host descriptor's own `balancer_server_name` takes precedence over
/// the config's `server_map` (balancer mapping is surjective, §3).
pub fn resolve_server_name<'a>(config: &'a BalancerConfig, host: &'a HostDescriptor) -> Option<&'a str> {
    host.balancer_server_name
        .as_deref()
        .or_else(|| config.server_map.get(&host.key()).map(String::as_str))
}

/// Set `host`'s backend server state on every configured balancer,
/// concurrently. Fails as a whole (but still reports every host's
/// individual result) if any balancer host fails.
pub fn set_server_state(config: &BalancerConfig, host: &HostDescriptor, state: ServerState) -> DrainOutcome {
    let Some(server_name) = resolve_server_name(config, host) else {
        return DrainOutcome {
            success: false,
            results: vec![BalancerHostResult {
                balancer_host: "<none>".into(),
                success: false,
                message: Some(format!("no balancer mapping configured for host {}", host.key())),
            }],
        };
    };

    let command = format!(
        "echo 'set server {}/{} state {}' | socat stdio {}",
        config.backend,
        server_name,
        state.as_str(),
        config.socket_path
    );

    run_on_every_balancer(config, &command)
}

/// A no-op pre-flight connectivity check against every balancer host,
/// using the same transport as the drain/ready commands (§4.9).
pub fn check_connectivity(config: &BalancerConfig) -> DrainOutcome {
    run_on_every_balancer(config, "true")
}

fn run_on_every_balancer(config: &BalancerConfig, remote_command: &str) -> DrainOutcome {
    let connect_timeout_secs = config.ssh_timeout.as_secs().max(1);
    let hard_timeout = config.ssh_timeout + Duration::from_secs(5);

    let mut handles = Vec::with_capacity(config.hosts.len());
    for balancer_host in &config.hosts {
        let balancer_host = balancer_host.clone();
        let user = config.user.clone();
        let ssh_port = config.ssh_port;
        let remote_command = remote_command.to_string();

        handles.push(thread::spawn(move || {
            let port_arg = ssh_port.to_string();
            let connect_timeout_arg = format!("ConnectTimeout={connect_timeout_secs}");
            let target = format!("{user}@{balancer_host}");
            let args = vec![
                "-o", "BatchMode=yes",
                "-o", "StrictHostKeyChecking=accept-new",
                "-o", connect_timeout_arg.as_str(),
                "-p", port_arg.as_str(),
                target.as_str(),
                "--",
                remote_command.as_str(),
            ];

            let outcome = run_command_with_timeout("ssh", &args, std::path::Path::new("."), Some(hard_timeout));

            match outcome {
                Ok(out) if out.timed_out => BalancerHostResult {
                    balancer_host,
                    success: false,
                    message: Some("remote shell command timed out".to_string()),
                },
                Ok(out) if out.exit_code == 0 => {
                    BalancerHostResult { balancer_host, success: true, message: None }
                }
                Ok(out) => BalancerHostResult {
                    balancer_host,
                    success: false,
                    message: Some(format!("exit code {}: {}", out.exit_code, out.stderr.trim())),
                },
                Err(e) => BalancerHostResult { balancer_host, success: false, message: Some(e.to_string()) },
            }
        }));
    }

    let results: Vec<BalancerHostResult> = handles
        .into_iter()
        .map(|h| h.join().expect("balancer host thread panicked"))
        .collect();

    let success = !results.is_empty() && results.iter().all(|r| r.success);
    DrainOutcome { success, results }
}
