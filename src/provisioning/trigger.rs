use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{COMPLETION_PAYLOAD, COMPLETION_SIGNAL, ProvisioningRequest};
use crate::config::GithubSettings;

const GITHUB_API_VERSION: &str = "2022-11-28";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The external pipeline actions this service can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Create,
    ArcIntegration,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Create => "create",
            ActionKind::ArcIntegration => "arc-integration",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ActionKind::Create),
            "arc-integration" => Ok(ActionKind::ArcIntegration),
            other => Err(format!("unknown action kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote rejected the call with status {status}")]
    RemoteRejected { status: u16 },
}

impl InvocationError {
    /// Missing configuration will not fix itself between attempts.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, InvocationError::MissingConfig(_))
    }
}

/// Inputs handed to the pipeline for `kind`. The two actions take different
/// parameter sets and different namespace conventions.
pub fn build_parameters(kind: ActionKind, request: &ProvisioningRequest) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("cluster_name".to_string(), request.name.clone());
    match kind {
        ActionKind::Create => {
            params.insert("namespace_name".to_string(), request.create_namespace());
            params.insert("cpu".to_string(), request.cpu.clone());
            params.insert("memory".to_string(), request.memory.clone());
            params.insert("storage".to_string(), request.storage.clone());
            // Lets the pipeline address its completion signal back to this execution
            params.insert("workflow_id".to_string(), request.execution_id.clone());
            params.insert("signal_name".to_string(), COMPLETION_SIGNAL.to_string());
            params.insert("signal_payload".to_string(), COMPLETION_PAYLOAD.to_string());
        }
        ActionKind::ArcIntegration => {
            params.insert("namespace_name".to_string(), request.arc_namespace());
        }
    }
    params
}

/// Starts an external pipeline run. Success means the run was accepted, not
/// that it finished. Implementations do not retry.
#[async_trait]
pub trait ActionTrigger: Send + Sync {
    async fn invoke(&self, kind: ActionKind, request: &ProvisioningRequest) -> Result<(), InvocationError>;
}

/// `ActionTrigger` backed by GitHub Actions `workflow_dispatch`.
#[derive(Clone)]
pub struct GithubActionTrigger {
    http: reqwest::Client,
    settings: GithubSettings,
}

#[derive(Serialize)]
struct DispatchBody<'a> {
    #[serde(rename = "ref")]
    git_ref: &'a str,
    inputs: BTreeMap<String, String>,
}

impl GithubActionTrigger {
    pub fn new(settings: GithubSettings) -> Result<Self, InvocationError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(GITHUB_API_VERSION));
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InvocationError::Transport(e.to_string()))?;
        Ok(Self { http, settings })
    }

    fn workflow_file(&self, kind: ActionKind) -> Option<&str> {
        match kind {
            ActionKind::Create => self.settings.vcluster_workflow_file.as_deref(),
            ActionKind::ArcIntegration => self.settings.arc_workflow_file.as_deref(),
        }
    }

    /// Dispatch URL for `kind`, or the names of the settings that are missing.
    pub fn dispatch_url(&self, kind: ActionKind) -> Result<String, InvocationError> {
        let file_key = match kind {
            ActionKind::Create => "VCLUSTER_WORKFLOW_FILE",
            ActionKind::ArcIntegration => "ARC_WORKFLOW_FILE",
        };
        let mut missing = Vec::new();
        if self.settings.token.is_none() {
            missing.push("GH_TOKEN");
        }
        let owner = self.settings.owner.as_deref().unwrap_or_else(|| {
            missing.push("REPO_OWNER");
            ""
        });
        let repo = self.settings.repo.as_deref().unwrap_or_else(|| {
            missing.push("REPO_NAME");
            ""
        });
        let file = self.workflow_file(kind).unwrap_or_else(|| {
            missing.push(file_key);
            ""
        });
        if !missing.is_empty() {
            return Err(InvocationError::MissingConfig(missing.join(", ")));
        }
        Ok(format!(
            "{}/repos/{owner}/{repo}/actions/workflows/{file}/dispatches",
            self.settings.api_url.trim_end_matches('/')
        ))
    }
}

#[async_trait]
impl ActionTrigger for GithubActionTrigger {
    async fn invoke(&self, kind: ActionKind, request: &ProvisioningRequest) -> Result<(), InvocationError> {
        let url = self.dispatch_url(kind)?;
        let token = self
            .settings
            .token
            .as_deref()
            .ok_or_else(|| InvocationError::MissingConfig("GH_TOKEN".to_string()))?;
        let body = DispatchBody {
            git_ref: &self.settings.git_ref,
            inputs: build_parameters(kind, request),
        };
        info!(action = %kind, cluster = %request.name, url = %url, "triggering GitHub workflow");

        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| InvocationError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            warn!(action = %kind, status = status.as_u16(), body = %detail, "GitHub rejected workflow dispatch");
            return Err(InvocationError::RemoteRejected {
                status: status.as_u16(),
            });
        }
        info!(action = %kind, cluster = %request.name, "GitHub workflow triggered");
        Ok(())
    }
}
