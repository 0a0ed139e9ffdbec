//! Transport client (spec.md §4.4): HTTP requests to a remote agent with
//! retry + backoff, 409-as-not-error semantics, and long-poll status
//! resolution.

use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use wharf_retry::{RetryExecutor, RetryStrategyConfig};
use wharf_types::{DeployError, DeployResult, DeploymentStatus, HostDescriptor};

/// `GET /hashes` response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HashesResponse {
    pub hashes: std::collections::BTreeMap<String, String>,
    pub status: String,
    #[serde(default)]
    pub file_count: Option<usize>,
}

/// `GET /status` response.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppServerStatus {
    pub healthy: bool,
    pub running: bool,
    #[serde(default)]
    pub domain: Option<String>,
    pub app_deployed: bool,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub war_path: Option<String>,
    #[serde(default)]
    pub process_count: Option<u32>,
}

/// `GET /health` response: agent reachability + version probe (§4.6 step 1).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub agent_version: String,
    #[serde(default)]
    pub plugin_version: Option<String>,
    pub app_server_running: bool,
}

/// `GET /plugins/versions` response (§4.6 step 2).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginVersionsResponse {
    pub has_updates: bool,
    pub versions: Vec<PluginVersion>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginVersion {
    pub package: String,
    pub current: String,
    pub latest: String,
    pub update_available: bool,
}

/// Inline deploy request body for `POST /deploy`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineDeployRequest {
    pub files: Vec<InlineFile>,
    pub deletions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineFile {
    pub path: String,
    #[serde(rename = "content-b64")]
    pub content_b64: String,
}

/// `POST /deploy/chunk` request body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub files: Vec<InlineFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_files: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResponse {
    pub session_id: String,
    pub files_received: usize,
    pub committed: bool,
    #[serde(default)]
    pub result: Option<DeployResult>,
}

/// The outcome of a deploy-shaped POST (`/deploy`, `/deploy/upload`,
/// `/deploy/chunk` with `commit`): either it completed synchronously, or
/// the server answered 409/timed out and the caller must poll (§4.4, §4.8).
#[derive(Debug, Clone)]
pub enum DeployOutcome {
    Completed(DeployResult),
    InProgress,
}

/// HTTP client to a single agent, with retry/backoff and the 409/timeout
/// fallback policies from §4.4.
pub struct AgentClient {
    http: Client,
    base_url: String,
    retry: RetryExecutor,
    deployment_timeout: Duration,
    status_poll_interval: Duration,
    status_poll_max_wait: Duration,
}

impl AgentClient {
    pub fn new(host: &HostDescriptor, retry_config: RetryStrategyConfig, timeouts: &wharf_types::TimeoutConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent(format!("wharf/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeouts.agent)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: host.base_url("http"),
            retry: RetryExecutor::new(retry_config),
            deployment_timeout: timeouts.deployment,
            status_poll_interval: timeouts.status_poll_interval,
            status_poll_max_wait: timeouts.status_poll_max_wait,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `GET /health` with retry. Final failure marks the host unreachable.
    pub fn health(&self) -> Result<HealthResponse, DeployError> {
        self.retry
            .run(|_attempt| {
                self.http
                    .get(self.url("/health"))
                    .send()
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| e.to_string())
                    .and_then(|r| r.json::<HealthResponse>().map_err(|e| e.to_string()))
            })
            .map_err(|_| DeployError::Unreachable)
    }

    /// `GET /plugins/versions`. A 404 means the agent predates this
    /// endpoint — treated as a soft, non-gating failure (§9 open question).
    pub fn plugin_versions(&self) -> Result<Option<PluginVersionsResponse>, DeployError> {
        let resp = self
            .http
            .get(self.url("/plugins/versions"))
            .send()
            .map_err(|e| DeployError::Transport { message: e.to_string() })?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let parsed = resp
            .json::<PluginVersionsResponse>()
            .map_err(|e| DeployError::Transport { message: e.to_string() })?;
        Ok(Some(parsed))
    }

    /// `GET /hashes` with retry.
    pub fn hashes(&self) -> Result<HashesResponse, DeployError> {
        self.retry
            .run(|_attempt| {
                self.http
                    .get(self.url("/hashes"))
                    .send()
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| e.to_string())
                    .and_then(|r| r.json::<HashesResponse>().map_err(|e| e.to_string()))
            })
            .map_err(|message| DeployError::HashFetchFailed { message })
    }

    /// `POST /deploy`: inline diff. 409 transitions to `DeployOutcome::InProgress`.
    pub fn deploy_inline(&self, body: &InlineDeployRequest) -> Result<DeployOutcome, DeployError> {
        self.post_deploy_shaped("/deploy", body)
    }

    /// `POST /deploy/upload`: full archive body.
    pub fn deploy_upload(&self, archive_bytes: Vec<u8>) -> Result<DeployOutcome, DeployError> {
        let resp = self
            .http
            .post(self.url("/deploy/upload"))
            .header("Content-Type", "application/octet-stream")
            .timeout(self.deployment_timeout)
            .body(archive_bytes)
            .send();

        self.interpret_deploy_response(resp)
    }

    /// `POST /deploy/chunk`.
    pub fn deploy_chunk(&self, req: &ChunkRequest) -> Result<ChunkResponse, DeployError> {
        let resp = self
            .http
            .post(self.url("/deploy/chunk"))
            .json(req)
            .send()
            .map_err(|e| DeployError::Transport { message: e.to_string() })?;

        if !resp.status().is_success() {
            return Err(DeployError::DeployFailed {
                message: format!("chunk upload failed with status {}", resp.status()),
            });
        }

        resp.json::<ChunkResponse>()
            .map_err(|e| DeployError::Transport { message: e.to_string() })
    }

    /// `DELETE /deploy/chunk/:id`.
    pub fn cancel_chunk(&self, session_id: &str) -> Result<(), DeployError> {
        let resp = self
            .http
            .delete(self.url(&format!("/deploy/chunk/{session_id}")))
            .send()
            .map_err(|e| DeployError::Transport { message: e.to_string() })?;
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(DeployError::Transport { message: format!("cancel failed with status {}", resp.status()) })
        }
    }

    fn post_deploy_shaped<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<DeployOutcome, DeployError> {
        let resp = self
            .http
            .post(self.url(path))
            .timeout(self.deployment_timeout)
            .json(body)
            .send();

        self.interpret_deploy_response(resp)
    }

    fn interpret_deploy_response(
        &self,
        resp: reqwest::Result<reqwest::blocking::Response>,
    ) -> Result<DeployOutcome, DeployError> {
        let resp = match resp {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Ok(DeployOutcome::InProgress),
            Err(e) if e.is_connect() => return Err(DeployError::Unreachable),
            Err(e) => return Err(DeployError::Transport { message: e.to_string() }),
        };

        if resp.status() == StatusCode::CONFLICT {
            return Ok(DeployOutcome::InProgress);
        }

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().unwrap_or_default();
            return Err(DeployError::DeployFailed { message: format!("status {status}: {body}") });
        }

        let result = resp
            .json::<DeployResult>()
            .map_err(|e| DeployError::Transport { message: e.to_string() })?;

        if !result.success {
            return Err(DeployError::DeployFailed {
                message: result.message.unwrap_or_else(|| "deploy failed".to_string()),
            });
        }

        Ok(DeployOutcome::Completed(result))
    }

    /// Long-poll `/deploy/status` until the server reports `deploying:false`
    /// with `lastCompletedAt` newer than `local_start` (§4.4, §4.11). The
    /// caller must capture `local_start` *before* issuing the deploy POST
    /// so transport-loss scenarios still reconcile correctly.
    pub fn poll_deploy_status(&self, local_start: DateTime<Utc>) -> Result<DeployResult, DeployError> {
        let deadline = Instant::now() + self.status_poll_max_wait;

        loop {
            let resp = self
                .http
                .get(self.url("/deploy/status"))
                .send()
                .map_err(|e| DeployError::Transport { message: e.to_string() })?;

            if resp.status().is_success() {
                let status = resp
                    .json::<DeploymentStatus>()
                    .map_err(|e| DeployError::Transport { message: e.to_string() })?;

                if !status.deploying {
                    if let (Some(completed_at), Some(result)) = (status.last_completed_at, status.last_result.clone()) {
                        if completed_at > local_start {
                            if result.success {
                                return Ok(result);
                            }
                            return Err(DeployError::DeployFailed {
                                message: result.message.unwrap_or_else(|| "deploy failed".to_string()),
                            });
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(DeployError::DeployTimeout);
            }

            std::thread::sleep(self.status_poll_interval);
        }
    }
}
