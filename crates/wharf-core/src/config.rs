//! `.wharf.toml` + environment variable + CLI flag configuration loader
//! (SPEC_FULL.md §4.14, §6). Precedence, lowest to highest: built-in
//! defaults, `.wharf.toml`, `WHARF_<FIELD>` environment variables, CLI
//! flags. Grounded on the teacher's `config.rs` nested-struct-with-
//! serde-defaults pattern and its `CliOverrides` merge model.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use wharf_duration::{deserialize_duration, serialize_duration};
use wharf_retry::{RetryStrategyConfig, RetryStrategyType};
use wharf_types::{HostDescriptor, TimeoutConfig};

pub const CONFIG_FILE_NAME: &str = ".wharf.toml";

/// Parse a `"address:port"` or `"address:port=balancer-server-name"` entry,
/// the textual form hosts take in `.wharf.toml` and on the CLI (§6).
pub fn parse_host_entry(entry: &str) -> Result<HostDescriptor> {
    let (addr_port, balancer_server_name) = match entry.split_once('=') {
        Some((left, name)) => (left, Some(name.to_string())),
        None => (entry, None),
    };

    let (address, port) = addr_port
        .rsplit_once(':')
        .with_context(|| format!("host entry {entry:?} is missing a port (expected address:port)"))?;

    let port: u16 = port
        .parse()
        .with_context(|| format!("host entry {entry:?} has an invalid port"))?;

    if address.is_empty() {
        bail!("host entry {entry:?} is missing an address");
    }

    Ok(HostDescriptor { address: address.to_string(), port, balancer_server_name })
}

/// `[balancer]` section of `.wharf.toml`, owned by [`crate::drain`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    pub backend: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub server_map: BTreeMap<String, String>,
    #[serde(default = "default_balancer_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(
        default = "default_ssh_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        rename = "ssh_timeout_ms"
    )]
    pub ssh_timeout: Duration,
}

fn default_balancer_user() -> String {
    "sysadmin".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_socket_path() -> String {
    "/run/haproxy/admin.sock".to_string()
}

fn default_ssh_timeout() -> Duration {
    Duration::from_millis(10_000)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct HostsFileConfig {
    #[serde(default)]
    entries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StrategyFileConfig {
    expression: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RetryFileConfig {
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(
        default = "default_base_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    base_delay: Duration,
    #[serde(
        default = "default_max_delay",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    max_delay: Duration,
    #[serde(default)]
    strategy: RetryStrategyType,
}

impl Default for RetryFileConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            strategy: RetryStrategyType::default(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TimeoutsFileConfig {
    #[serde(
        default = "default_agent_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        rename = "agent_ms"
    )]
    agent: Duration,
    #[serde(
        default = "default_deployment_timeout",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        rename = "deployment_ms"
    )]
    deployment: Duration,
    #[serde(
        default = "default_poll_interval",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        rename = "status_poll_interval_ms"
    )]
    status_poll_interval: Duration,
    #[serde(
        default = "default_poll_max_wait",
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        rename = "status_poll_max_wait_ms"
    )]
    status_poll_max_wait: Duration,
}

impl Default for TimeoutsFileConfig {
    fn default() -> Self {
        Self {
            agent: default_agent_timeout(),
            deployment: default_deployment_timeout(),
            status_poll_interval: default_poll_interval(),
            status_poll_max_wait: default_poll_max_wait(),
        }
    }
}

fn default_agent_timeout() -> Duration {
    Duration::from_millis(10_000)
}

fn default_deployment_timeout() -> Duration {
    Duration::from_millis(120_000)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(2_000)
}

fn default_poll_max_wait() -> Duration {
    Duration::from_millis(180_000)
}

impl From<TimeoutsFileConfig> for TimeoutConfig {
    fn from(f: TimeoutsFileConfig) -> Self {
        TimeoutConfig {
            agent: f.agent,
            deployment: f.deployment,
            status_poll_interval: f.status_poll_interval,
            status_poll_max_wait: f.status_poll_max_wait,
        }
    }
}

/// The raw shape of `.wharf.toml` (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct WharfFileConfig {
    #[serde(default)]
    hosts: HostsFileConfig,
    #[serde(default)]
    strategy: StrategyFileConfig,
    #[serde(default)]
    retry: RetryFileConfig,
    #[serde(default)]
    timeouts: TimeoutsFileConfig,
    #[serde(default)]
    balancer: Option<BalancerConfig>,
}

// `RetryFileConfig` and `TimeoutsFileConfig` derive `Default` via their
// own `impl Default`; `#[serde(default)]` on `WharfFileConfig`'s fields
// needs those impls, declared above, to exist before this point is reached.

/// Fully resolved configuration, after merging file, environment, and CLI
/// layers (§4.14).
#[derive(Debug, Clone)]
pub struct WharfConfig {
    pub hosts: Vec<HostDescriptor>,
    pub strategy_expression: String,
    pub retry: RetryStrategyConfig,
    pub timeouts: TimeoutConfig,
    pub balancer: Option<BalancerConfig>,
}

impl Default for WharfConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            strategy_expression: "sequential".to_string(),
            retry: RetryStrategyConfig {
                strategy: RetryStrategyType::default(),
                max_attempts: default_max_attempts(),
                base_delay: default_base_delay(),
                max_delay: default_max_delay(),
                jitter: 0.5,
            },
            timeouts: TimeoutConfig::default(),
            balancer: None,
        }
    }
}

/// CLI overrides for merging with config file and environment values.
/// `Option` fields mean "the user did not pass this flag".
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub hosts: Option<Vec<String>>,
    pub strategy_expression: Option<String>,
    pub max_attempts: Option<u32>,
    pub base_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub retry_strategy: Option<RetryStrategyType>,
    pub agent_timeout: Option<Duration>,
    pub deployment_timeout: Option<Duration>,
}

impl WharfConfig {
    /// Load `.wharf.toml` from `workspace_root`, if present, merge
    /// `WHARF_<FIELD>` environment overrides and then `overrides`, and
    /// validate the result.
    pub fn load(workspace_root: &Path, overrides: &CliOverrides) -> Result<Self> {
        let file = Self::load_file(workspace_root)?.unwrap_or_default();
        let config = Self::merge(file, overrides)?;
        config.validate()?;
        Ok(config)
    }

    fn load_file(workspace_root: &Path) -> Result<Option<WharfFileConfig>> {
        let path = workspace_root.join(CONFIG_FILE_NAME);
        if !path.exists() {
            return Ok(None);
        }
        Self::parse_file(&path).map(Some)
    }

    /// Load configuration from a specific file path, bypassing the
    /// workspace-root search. Exposed for callers (tests, `wharf --config`)
    /// that already know the exact path.
    pub fn load_from_file(path: &Path, overrides: &CliOverrides) -> Result<Self> {
        let file = Self::parse_file(path)?;
        let config = Self::merge(file, overrides)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<WharfFileConfig> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config file {}", path.display()))
    }

    fn merge(file: WharfFileConfig, overrides: &CliOverrides) -> Result<Self> {
        let mut hosts = file.hosts.entries;
        if let Ok(env_hosts) = std::env::var("WHARF_HOSTS") {
            hosts = env_hosts.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
        }
        if let Some(cli_hosts) = &overrides.hosts {
            hosts = cli_hosts.clone();
        }
        let hosts = hosts
            .iter()
            .map(|s| parse_host_entry(s))
            .collect::<Result<Vec<_>>>()
            .context("failed to parse configured hosts")?;

        let mut strategy_expression = file.strategy.expression.unwrap_or_else(|| "sequential".to_string());
        if let Ok(env_strategy) = std::env::var("WHARF_STRATEGY") {
            strategy_expression = env_strategy;
        }
        if let Some(cli_strategy) = &overrides.strategy_expression {
            strategy_expression = cli_strategy.clone();
        }

        let mut retry = RetryStrategyConfig {
            strategy: file.retry.strategy,
            max_attempts: file.retry.max_attempts,
            base_delay: file.retry.base_delay,
            max_delay: file.retry.max_delay,
            jitter: 0.5,
        };
        if let Ok(env_attempts) = std::env::var("WHARF_RETRY_MAX_ATTEMPTS") {
            retry.max_attempts = env_attempts.parse().context("WHARF_RETRY_MAX_ATTEMPTS must be an integer")?;
        }
        if let Some(v) = overrides.max_attempts {
            retry.max_attempts = v;
        }
        if let Some(v) = overrides.base_delay {
            retry.base_delay = v;
        }
        if let Some(v) = overrides.max_delay {
            retry.max_delay = v;
        }
        if let Some(v) = overrides.retry_strategy {
            retry.strategy = v;
        }

        let mut timeouts: TimeoutConfig = file.timeouts.into();
        if let Ok(env_ms) = std::env::var("WHARF_AGENT_TIMEOUT_MS") {
            timeouts.agent = Duration::from_millis(env_ms.parse().context("WHARF_AGENT_TIMEOUT_MS must be an integer")?);
        }
        if let Some(v) = overrides.agent_timeout {
            timeouts.agent = v;
        }
        if let Ok(env_ms) = std::env::var("WHARF_DEPLOYMENT_TIMEOUT_MS") {
            timeouts.deployment =
                Duration::from_millis(env_ms.parse().context("WHARF_DEPLOYMENT_TIMEOUT_MS must be an integer")?);
        }
        if let Some(v) = overrides.deployment_timeout {
            timeouts.deployment = v;
        }

        Ok(WharfConfig { hosts, strategy_expression, retry, timeouts, balancer: file.balancer })
    }

    fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be greater than 0");
        }
        if self.retry.base_delay.is_zero() {
            bail!("retry.base_delay must be greater than 0");
        }
        if self.retry.max_delay < self.retry.base_delay {
            bail!("retry.max_delay must be greater than or equal to retry.base_delay");
        }
        if self.timeouts.agent.is_zero() {
            bail!("timeouts.agent_ms must be greater than 0");
        }
        if self.timeouts.deployment.is_zero() {
            bail!("timeouts.deployment_ms must be greater than 0");
        }
        if let Some(balancer) = &self.balancer {
            if balancer.hosts.is_empty() {
                bail!("balancer.hosts must not be empty when [balancer] is configured");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn parse_host_entry_without_balancer_name() {
        let host = parse_host_entry("10.0.1.10:7070").unwrap();
        assert_eq!(host.address, "10.0.1.10");
        assert_eq!(host.port, 7070);
        assert_eq!(host.balancer_server_name, None);
    }

    #[test]
    fn parse_host_entry_with_balancer_name() {
        let host = parse_host_entry("10.0.1.10:7070=app1").unwrap();
        assert_eq!(host.balancer_server_name.as_deref(), Some("app1"));
    }

    #[test]
    fn parse_host_entry_rejects_missing_port() {
        assert!(parse_host_entry("10.0.1.10").is_err());
    }

    #[test]
    fn load_from_file_parses_full_schema() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            r#"
[hosts]
entries = ["10.0.1.10:7070=app1", "10.0.1.11:7070=app2"]

[strategy]
expression = "1+R"

[retry]
max_attempts = 5
base_delay = "500ms"
max_delay = "30s"

[timeouts]
agent_ms = 10000
deployment_ms = 120000
status_poll_interval_ms = 2000
status_poll_max_wait_ms = 180000

[balancer]
backend = "app_backend"
hosts = ["lb1.internal", "lb2.internal"]
user = "sysadmin"
ssh_port = 22
socket_path = "/run/haproxy/admin.sock"
ssh_timeout_ms = 10000

[balancer.server_map]
"10.0.1.10:7070" = "app1"
"10.0.1.11:7070" = "app2"
"#,
        )
        .unwrap();

        let config = WharfConfig::load_from_file(&path, &CliOverrides::default()).unwrap();
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.strategy_expression, "1+R");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.timeouts.deployment, Duration::from_secs(120));
        let balancer = config.balancer.unwrap();
        assert_eq!(balancer.backend, "app_backend");
        assert_eq!(balancer.server_map.get("10.0.1.10:7070").map(String::as_str), Some("app1"));
    }

    #[test]
    fn missing_file_loads_builtin_defaults() {
        let td = tempfile::tempdir().unwrap();
        let config = WharfConfig::load(td.path(), &CliOverrides::default()).unwrap();
        assert!(config.hosts.is_empty());
        assert_eq!(config.strategy_expression, "sequential");
        assert!(config.balancer.is_none());
    }

    #[test]
    #[serial]
    fn env_var_overrides_file_value() {
        let td = tempfile::tempdir().unwrap();
        std::env::set_var("WHARF_STRATEGY", "parallel");
        let config = WharfConfig::load(td.path(), &CliOverrides::default()).unwrap();
        std::env::remove_var("WHARF_STRATEGY");
        assert_eq!(config.strategy_expression, "parallel");
    }

    #[test]
    #[serial]
    fn cli_override_beats_env_and_file() {
        let td = tempfile::tempdir().unwrap();
        std::env::set_var("WHARF_STRATEGY", "parallel");
        let overrides = CliOverrides { strategy_expression: Some("2+R".to_string()), ..Default::default() };
        let config = WharfConfig::load(td.path(), &overrides).unwrap();
        std::env::remove_var("WHARF_STRATEGY");
        assert_eq!(config.strategy_expression, "2+R");
    }

    #[test]
    fn validate_rejects_max_delay_below_base_delay() {
        let mut config = WharfConfig::default();
        config.retry.base_delay = Duration::from_secs(10);
        config.retry.max_delay = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_balancer_with_no_hosts() {
        let mut config = WharfConfig::default();
        config.balancer = Some(BalancerConfig {
            backend: "app_backend".into(),
            hosts: vec![],
            server_map: BTreeMap::new(),
            user: default_balancer_user(),
            ssh_port: default_ssh_port(),
            socket_path: default_socket_path(),
            ssh_timeout: default_ssh_timeout(),
        });
        assert!(config.validate().is_err());
    }
}
