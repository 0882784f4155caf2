//! Settings loaded once at startup from `.env`, an optional TOML file, and
//! the process environment, then passed to whatever needs them.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use tracing::debug;

use crate::provisioning::OrchestrationPolicy;
use crate::runtime::{ActivityOptions, RetryPolicy};

pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_GIT_REF: &str = "main";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_STORE_DIR: &str = "./data";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {0}")]
    Missing(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error(transparent)]
    Source(#[from] config::ConfigError),
}

/// Flat view of the configuration keys. Environment variables map onto
/// these by lowercasing (`GH_TOKEN` -> `gh_token`); a TOML file uses the
/// same names.
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    gh_token: Option<String>,
    repo_owner: Option<String>,
    repo_name: Option<String>,
    vcluster_workflow_file: Option<String>,
    arc_workflow_file: Option<String>,
    // Actions runners export GITHUB_API_URL and GITHUB_REF for their own job
    dispatch_api_url: Option<String>,
    dispatch_ref: Option<String>,
    step_timeout_secs: Option<u64>,
    step_max_attempts: Option<u32>,
    step_initial_backoff_ms: Option<u64>,
    step_max_backoff_ms: Option<u64>,
    completion_timeout_secs: Option<u64>,
    max_create_attempts: Option<u32>,
    listen_addr: Option<String>,
    store_dir: Option<String>,
}

/// Connection details for the GitHub Actions API. Required fields stay
/// optional here so the trigger can report exactly what is missing.
#[derive(Clone)]
pub struct GithubSettings {
    pub token: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub vcluster_workflow_file: Option<String>,
    pub arc_workflow_file: Option<String>,
    pub api_url: String,
    pub git_ref: String,
}

impl fmt::Debug for GithubSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GithubSettings")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("vcluster_workflow_file", &self.vcluster_workflow_file)
            .field("arc_workflow_file", &self.arc_workflow_file)
            .field("api_url", &self.api_url)
            .field("git_ref", &self.git_ref)
            .finish()
    }
}

impl Default for GithubSettings {
    fn default() -> Self {
        Self {
            token: None,
            owner: None,
            repo: None,
            vcluster_workflow_file: None,
            arc_workflow_file: None,
            api_url: DEFAULT_GITHUB_API_URL.to_string(),
            git_ref: DEFAULT_GIT_REF.to_string(),
        }
    }
}

/// Time budget and retry policy applied to each provisioning step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepSettings {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
    pub store_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub github: GithubSettings,
    pub steps: StepSettings,
    pub orchestration: OrchestrationPolicy,
    pub server: ServerSettings,
}

/// Load `.env` from the working directory when one exists. Variables that
/// are already set win over the file.
pub fn load_env_file() -> Option<PathBuf> {
    if !Path::new(".env").exists() {
        return None;
    }
    match dotenvy::dotenv() {
        Ok(path) => {
            debug!(path = %path.display(), "loaded .env");
            Some(path)
        }
        Err(e) => {
            debug!(error = %e, "could not load .env");
            None
        }
    }
}

impl Settings {
    /// Read settings from the optional TOML file and the process environment.
    /// Environment variables override file values.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(file, None)
    }

    /// Like `load`, with an explicit environment map in place of the
    /// process environment.
    pub fn load_from(file: Option<&Path>, env: Option<config::Map<String, String>>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path));
        }
        let config = builder.add_source(Environment::default().source(env)).build()?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> Result<Self, ConfigError> {
        let raw: RawSettings = config.try_deserialize()?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        let listen = non_empty(raw.listen_addr).unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = listen.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
            key: "LISTEN_ADDR",
            reason: format!("{listen:?}: {e}"),
        })?;

        let defaults = StepSettings::default();
        let policy = OrchestrationPolicy::default();
        Ok(Self {
            github: GithubSettings {
                token: non_empty(raw.gh_token),
                owner: non_empty(raw.repo_owner),
                repo: non_empty(raw.repo_name),
                vcluster_workflow_file: non_empty(raw.vcluster_workflow_file),
                arc_workflow_file: non_empty(raw.arc_workflow_file),
                api_url: non_empty(raw.dispatch_api_url).unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string()),
                git_ref: non_empty(raw.dispatch_ref).unwrap_or_else(|| DEFAULT_GIT_REF.to_string()),
            },
            steps: StepSettings {
                timeout: raw.step_timeout_secs.map(Duration::from_secs).unwrap_or(defaults.timeout),
                max_attempts: raw.step_max_attempts.unwrap_or(defaults.max_attempts),
                initial_backoff: raw
                    .step_initial_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.initial_backoff),
                max_backoff: raw
                    .step_max_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_backoff),
            },
            orchestration: OrchestrationPolicy {
                completion_timeout_ms: raw
                    .completion_timeout_secs
                    .map(|s| s.saturating_mul(1000))
                    .unwrap_or(policy.completion_timeout_ms),
                max_create_attempts: raw.max_create_attempts.unwrap_or(policy.max_create_attempts),
            },
            server: ServerSettings {
                listen_addr,
                store_dir: PathBuf::from(non_empty(raw.store_dir).unwrap_or_else(|| DEFAULT_STORE_DIR.to_string())),
            },
        })
    }

    /// Startup check: the variables every run needs must be present and the
    /// numeric limits must be usable. `ARC_WORKFLOW_FILE` is only checked when
    /// the onboarding step runs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let gh = &self.github;
        let missing: Vec<&str> = [
            ("GH_TOKEN", gh.token.is_none()),
            ("REPO_OWNER", gh.owner.is_none()),
            ("REPO_NAME", gh.repo.is_none()),
            ("VCLUSTER_WORKFLOW_FILE", gh.vcluster_workflow_file.is_none()),
        ]
        .into_iter()
        .filter_map(|(key, absent)| absent.then_some(key))
        .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing.join(", ")));
        }
        if self.steps.timeout.is_zero() {
            return Err(invalid("STEP_TIMEOUT_SECS", "must be greater than zero"));
        }
        if self.steps.max_attempts == 0 {
            return Err(invalid("STEP_MAX_ATTEMPTS", "must be at least 1"));
        }
        if self.orchestration.completion_timeout_ms == 0 {
            return Err(invalid("COMPLETION_TIMEOUT_SECS", "must be greater than zero"));
        }
        if self.orchestration.max_create_attempts == 0 {
            return Err(invalid("MAX_CREATE_ATTEMPTS", "must be at least 1"));
        }
        Ok(())
    }

    /// Options the worker applies to each step activity.
    pub fn activity_options(&self) -> ActivityOptions {
        ActivityOptions {
            start_to_close: Some(self.steps.timeout),
            retry: RetryPolicy {
                max_attempts: self.steps.max_attempts,
                initial_backoff: self.steps.initial_backoff,
                max_backoff: self.steps.max_backoff,
                ..RetryPolicy::default()
            },
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("GH_TOKEN", "ghp_test"),
            ("REPO_OWNER", "acme"),
            ("REPO_NAME", "infra"),
            ("VCLUSTER_WORKFLOW_FILE", "vcluster.yml"),
        ]
    }

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let settings = Settings::load_from(None, env(&required())).unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.github.api_url, DEFAULT_GITHUB_API_URL);
        assert_eq!(settings.github.git_ref, "main");
        assert_eq!(settings.github.arc_workflow_file, None);
        assert_eq!(settings.steps, StepSettings::default());
        assert_eq!(settings.orchestration, OrchestrationPolicy::default());
        assert_eq!(settings.server.listen_addr, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(settings.server.store_dir, PathBuf::from("./data"));

        let opts = settings.activity_options();
        assert_eq!(opts.start_to_close, Some(Duration::from_secs(600)));
        assert_eq!(opts.retry.max_attempts, 3);
    }

    #[test]
    fn runner_variables_do_not_leak_into_dispatch_target() {
        let mut vars = required();
        vars.extend([
            ("GITHUB_REF", "refs/pull/1/merge"),
            ("GITHUB_API_URL", "https://ghe.example/api/v3"),
        ]);
        let settings = Settings::load_from(None, env(&vars)).unwrap();
        assert_eq!(settings.github.git_ref, "main");
        assert_eq!(settings.github.api_url, DEFAULT_GITHUB_API_URL);

        vars.extend([("DISPATCH_REF", "release"), ("DISPATCH_API_URL", "http://127.0.0.1:9")]);
        let settings = Settings::load_from(None, env(&vars)).unwrap();
        assert_eq!(settings.github.git_ref, "release");
        assert_eq!(settings.github.api_url, "http://127.0.0.1:9");
    }

    #[test]
    fn validate_names_every_missing_variable() {
        let settings = Settings::load_from(None, env(&[("REPO_OWNER", "acme"), ("GH_TOKEN", "  ")])).unwrap();
        let err = settings.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing required environment variables: GH_TOKEN, REPO_NAME, VCLUSTER_WORKFLOW_FILE"
        );
    }

    #[test]
    fn numeric_overrides_are_parsed() {
        let mut vars = required();
        vars.extend([
            ("STEP_TIMEOUT_SECS", "5"),
            ("STEP_MAX_ATTEMPTS", "2"),
            ("COMPLETION_TIMEOUT_SECS", "60"),
            ("MAX_CREATE_ATTEMPTS", "1"),
            ("LISTEN_ADDR", "127.0.0.1:9000"),
        ]);
        let settings = Settings::load_from(None, env(&vars)).unwrap();
        assert_eq!(settings.steps.timeout, Duration::from_secs(5));
        assert_eq!(settings.steps.max_attempts, 2);
        assert_eq!(settings.orchestration.completion_timeout_ms, 60_000);
        assert_eq!(settings.orchestration.max_create_attempts, 1);
        assert_eq!(settings.server.listen_addr.port(), 9000);
    }

    #[test]
    fn zero_attempts_and_bad_addresses_are_rejected() {
        let mut vars = required();
        vars.push(("STEP_MAX_ATTEMPTS", "0"));
        let settings = Settings::load_from(None, env(&vars)).unwrap();
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { key: "STEP_MAX_ATTEMPTS", .. })
        ));

        let err = Settings::load_from(None, env(&[("LISTEN_ADDR", "not-an-addr")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "LISTEN_ADDR", .. }));
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "repo_owner = \"from-file\"\narc_workflow_file = \"arc.yml\"").unwrap();
        let settings = Settings::load_from(Some(file.path()), env(&[("REPO_OWNER", "from-env")])).unwrap();
        assert_eq!(settings.github.owner.as_deref(), Some("from-env"));
        assert_eq!(settings.github.arc_workflow_file.as_deref(), Some("arc.yml"));
    }

    #[test]
    fn debug_output_hides_the_token() {
        let gh = GithubSettings {
            token: Some("ghp_secret".into()),
            ..GithubSettings::default()
        };
        let printed = format!("{gh:?}");
        assert!(!printed.contains("ghp_secret"));
        assert!(printed.contains("<redacted>"));
    }
}
