//! `wharf`: the CLI that coordinates a fleet WAR rollout (spec.md §6).
//!
//! Subcommands:
//! - `wharf deploy` - run (or resume) a rollout against the configured
//!   or overridden fleet.
//! - `wharf preflight` - the read-only reachability + diff pass, no writes.
//! - `wharf status` - print the persisted rollout record, if any.
//! - `wharf events` - print the rollout's JSONL event log.

mod progress;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use wharf_core::config::{CliOverrides, WharfConfig};
use wharf_core::coordinator::{self, HostDeployInput};
use wharf_core::lock::LockFile;
use wharf_core::preflight::{self, PreflightInput, PreflightReport};
use wharf_core::strategy::parse_strategy;
use wharf_core::{archive, store};
use wharf_events::EventLog;
use wharf_retry::RetryStrategyType;
use wharf_types::{HostRolloutState, RolloutEvent, RolloutEventType};

use progress::ProgressReporter;

#[derive(Parser, Debug)]
#[command(name = "wharf", version, about = "Fleet WAR rollout coordinator")]
struct Cli {
    /// Directory to look for `.wharf.toml` in.
    #[arg(long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Directory holding the operator lock, rollout record, and event log.
    #[arg(long, global = true, default_value = ".wharf-state")]
    state_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run or resume a rollout.
    Deploy(DeployArgs),
    /// Check reachability and compute the diff against every host, without deploying.
    Preflight(TargetArgs),
    /// Print the persisted rollout record for `state_dir`, if one exists.
    Status,
    /// Print the rollout's event log.
    Events(EventsArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct TargetArgs {
    /// Path to the local archive (WAR or ZIP) to roll out.
    #[arg(long)]
    archive: PathBuf,

    /// Host entries as `address:port` or `address:port=balancer-name`,
    /// overriding `.wharf.toml`'s `[hosts]` section.
    #[arg(long = "host")]
    hosts: Vec<String>,

    /// Rollout strategy expression (`sequential`, `parallel`, or an
    /// `N+M+...+R` canary expression), overriding `.wharf.toml`.
    #[arg(long)]
    strategy: Option<String>,

    /// Upload the full archive to every host regardless of the computed diff.
    #[arg(long)]
    force: bool,

    /// Skip the advisory agent-version compatibility probe.
    #[arg(long)]
    skip_version_check: bool,

    #[arg(long)]
    max_attempts: Option<u32>,
    #[arg(long, value_parser = parse_duration_flag)]
    base_delay: Option<Duration>,
    #[arg(long, value_parser = parse_duration_flag)]
    max_delay: Option<Duration>,
    #[arg(long, value_parser = parse_retry_strategy_flag)]
    retry_strategy: Option<RetryStrategyType>,
    #[arg(long, value_parser = parse_duration_flag)]
    agent_timeout: Option<Duration>,
    #[arg(long, value_parser = parse_duration_flag)]
    deployment_timeout: Option<Duration>,
}

#[derive(clap::Args, Debug, Clone)]
struct DeployArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Resume the rollout already recorded in `state_dir`, if one exists,
    /// instead of always starting fresh.
    #[arg(long)]
    resume: bool,

    /// On `--resume`, skip hosts already marked `failed` or `skipped`
    /// rather than retrying them.
    #[arg(long)]
    no_retry_failed: bool,
}

fn parse_duration_flag(s: &str) -> Result<Duration, String> {
    wharf_duration::parse_duration(s).map_err(|e| e.to_string())
}

fn parse_retry_strategy_flag(s: &str) -> Result<RetryStrategyType, String> {
    match s.to_ascii_lowercase().as_str() {
        "immediate" => Ok(RetryStrategyType::Immediate),
        "exponential" => Ok(RetryStrategyType::Exponential),
        "linear" => Ok(RetryStrategyType::Linear),
        "constant" => Ok(RetryStrategyType::Constant),
        other => Err(format!("unknown retry strategy {other:?} (expected immediate/exponential/linear/constant)")),
    }
}

impl TargetArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            hosts: if self.hosts.is_empty() { None } else { Some(self.hosts.clone()) },
            strategy_expression: self.strategy.clone(),
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            retry_strategy: self.retry_strategy,
            agent_timeout: self.agent_timeout,
            deployment_timeout: self.deployment_timeout,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Command::Deploy(args) => run_deploy(&cli.workspace, &cli.state_dir, args),
        Command::Preflight(args) => run_preflight_command(&cli.workspace, args),
        Command::Status => run_status(&cli.state_dir),
        Command::Events(args) => run_events(&cli.state_dir, args),
    }
}

fn load_config(workspace: &PathBuf, target: &TargetArgs) -> Result<WharfConfig> {
    WharfConfig::load(workspace, &target.overrides()).context("failed to load configuration")
}

fn run_preflight_command(workspace: &PathBuf, args: TargetArgs) -> Result<ExitCode> {
    let config = load_config(workspace, &args)?;
    if config.hosts.is_empty() {
        anyhow::bail!("no hosts configured: pass --host or set [hosts] in .wharf.toml");
    }
    let strategy = parse_strategy(&config.strategy_expression).context("invalid strategy expression")?;
    let local_index = archive::index_archive(&args.archive)
        .with_context(|| format!("failed to index archive {}", args.archive.display()))?;

    let input = PreflightInput {
        hosts: config.hosts.clone(),
        local_index,
        local_archive_path: args.archive.clone(),
        force: args.force,
        skip_version_check: args.skip_version_check,
        retry_config: config.retry.clone(),
        timeouts: config.timeouts.clone(),
    };

    let report = preflight::run_preflight(&input);
    print_preflight_report(&strategy, &report);

    if report.reachable.len() == config.hosts.len() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_preflight_report(strategy: &wharf_types::DeploymentStrategy, report: &PreflightReport) {
    println!("strategy: {}", strategy.display_name());
    for (key, result) in &report.results {
        if result.reachable {
            println!(
                "  {key}: reachable, {} changed, {} deleted{}",
                result.summary.changed_count,
                result.summary.deleted_count,
                if result.summary.is_full_upload { " (full upload)" } else { "" }
            );
        } else {
            println!("  {key}: unreachable ({})", result.error.as_deref().unwrap_or("no detail"));
        }
    }
}

fn run_deploy(workspace: &PathBuf, state_dir: &PathBuf, args: DeployArgs) -> Result<ExitCode> {
    let config = load_config(workspace, &args.target)?;
    if config.hosts.is_empty() {
        anyhow::bail!("no hosts configured: pass --host or set [hosts] in .wharf.toml");
    }
    let strategy = parse_strategy(&config.strategy_expression).context("invalid strategy expression")?;

    let mut lock = LockFile::acquire(state_dir)
        .context("another wharf deploy is already running against this state dir")?;

    let mut record = store::start_or_resume(state_dir, strategy.clone(), config.hosts.clone(), args.resume)
        .context("failed to start or resume rollout record")?;
    lock.set_plan_id(&record.rollout_id).ok();

    let events_path = wharf_events::events_path(state_dir);
    let log_event = |event_type: RolloutEventType, host: Option<String>| {
        let event = RolloutEvent::now(host, event_type);
        let _ = EventLog::append_one(&events_path, &event);
    };

    let targets = record.hosts_to_retry(!args.no_retry_failed);
    if targets.is_empty() {
        println!("rollout {} already fully succeeded; nothing to do", record.rollout_id);
        return Ok(ExitCode::SUCCESS);
    }

    log_event(
        RolloutEventType::RolloutStarted { strategy: strategy.display_name(), host_count: targets.len() },
        None,
    );

    let local_index = archive::index_archive(&args.target.archive)
        .with_context(|| format!("failed to index archive {}", args.target.archive.display()))?;

    let preflight_input = PreflightInput {
        hosts: targets.clone(),
        local_index,
        local_archive_path: args.target.archive.clone(),
        force: args.target.force,
        skip_version_check: args.target.skip_version_check,
        retry_config: config.retry.clone(),
        timeouts: config.timeouts.clone(),
    };
    let report = preflight::run_preflight(&preflight_input);

    // Hosts that didn't respond to preflight are marked failed outright and
    // excluded from the coordinator's host list; they're still eligible for
    // `--resume` on a later run.
    let mut deploy_hosts = Vec::new();
    for host in &targets {
        match report.results.get(&host.key()) {
            Some(result) if result.reachable => deploy_hosts.push(host.clone()),
            Some(result) => {
                let message = result.error.clone().unwrap_or_else(|| "host unreachable".to_string());
                record.host_states.insert(host.key(), HostRolloutState::Failed { reason: message.clone() });
                log_event(
                    RolloutEventType::HostFailed { class: wharf_types::ErrorClass::Retryable, message },
                    Some(host.key()),
                );
            }
            None => {}
        }
    }
    store::save_rollout(state_dir, &record).ok();

    let progress = ProgressReporter::new(deploy_hosts.len());
    let balancer = config.balancer.clone();
    let retry_config = config.retry.clone();
    let timeouts = config.timeouts.clone();
    let archive_path = args.target.archive.clone();
    let preflight_results = report.results.clone();
    let events_path_for_closure = events_path.clone();

    let summary = if deploy_hosts.is_empty() {
        wharf_types::RolloutSummary::default()
    } else {
        coordinator::run_rollout(&strategy, &deploy_hosts, move |host| {
            let result = preflight_results.get(&host.key()).cloned();
            let (diff, is_full_upload) = match &result {
                Some(r) => (r.diff.clone(), r.summary.is_full_upload),
                None => (wharf_types::Diff::default(), true),
            };

            let input = HostDeployInput {
                host,
                diff: &diff,
                is_full_upload,
                local_archive_path: &archive_path,
                balancer: balancer.as_ref(),
                retry_config: retry_config.clone(),
                timeouts: &timeouts,
            };

            let outcome = coordinator::deploy_one_host(&input);
            let event = match &outcome {
                Ok(()) => RolloutEvent::now(Some(host.key()), RolloutEventType::HostSucceeded),
                Err(e) => {
                    let (class, _) = coordinator::classify_deploy_failure(&e.to_string());
                    RolloutEvent::now(Some(host.key()), RolloutEventType::HostFailed { class, message: e.to_string() })
                }
            };
            let _ = EventLog::append_one(&events_path_for_closure, &event);
            outcome
        })
    };

    progress.finish();

    for (key, outcome) in &summary.results {
        let state = match outcome {
            wharf_types::HostOutcome::Succeeded => HostRolloutState::Succeeded,
            wharf_types::HostOutcome::Skipped => {
                HostRolloutState::Skipped { reason: "canary batch aborted before this host's turn".into() }
            }
            wharf_types::HostOutcome::Failed | wharf_types::HostOutcome::Unreachable => {
                HostRolloutState::Failed { reason: format!("{outcome:?}") }
            }
        };
        record.host_states.insert(key.clone(), state);
    }
    store::save_rollout(state_dir, &record).context("failed to persist rollout record")?;

    log_event(
        RolloutEventType::RolloutFinished {
            successful: summary.successful,
            failed: summary.failed,
            skipped: summary.skipped,
            aborted: summary.aborted,
        },
        None,
    );

    print_rollout_summary(&record.rollout_id, &summary);

    if record.is_fully_succeeded() {
        store::clear_rollout(state_dir).ok();
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn print_rollout_summary(rollout_id: &str, summary: &wharf_types::RolloutSummary) {
    println!("rollout {rollout_id}:");
    println!(
        "  {} succeeded, {} failed, {} skipped{}",
        summary.successful,
        summary.failed,
        summary.skipped,
        if summary.aborted { " (aborted)" } else { "" }
    );
    for (key, outcome) in &summary.results {
        println!("  {key}: {outcome:?}");
    }
}

fn run_status(state_dir: &PathBuf) -> Result<ExitCode> {
    match store::load_rollout(state_dir)? {
        None => {
            println!("no rollout record in {}", state_dir.display());
            Ok(ExitCode::SUCCESS)
        }
        Some(record) => {
            println!("rollout {} ({})", record.rollout_id, record.strategy.display_name());
            println!("started at {}", record.started_at.to_rfc3339());
            for (key, state) in &record.host_states {
                println!("  {key}: {state:?}");
            }
            if record.is_fully_succeeded() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
struct EventsArgs {
    /// Only show events for this host key (`address:port`).
    #[arg(long)]
    host: Option<String>,
}

fn run_events(state_dir: &PathBuf, args: EventsArgs) -> Result<ExitCode> {
    let path = wharf_events::events_path(state_dir);
    let log = EventLog::read_from_file(&path).context("failed to read event log")?;

    let events: Vec<&RolloutEvent> = match &args.host {
        Some(host) => log.events_for_host(host),
        None => log.all_events().iter().collect(),
    };

    for event in events {
        let host = event.host.as_deref().unwrap_or("-");
        println!("{} {host} {:?}", event.timestamp.to_rfc3339(), event.event_type);
    }

    Ok(ExitCode::SUCCESS)
}
