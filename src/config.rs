use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote repository the tree is mirrored to
    #[serde(default)]
    pub github: GitHubConfig,

    /// Local chat state
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub repo: String,
    /// Personal access token; `GITHUB_TOKEN` takes precedence
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Per-request HTTP timeout
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Retries for transient failures (transport errors, 5xx, 429)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory holding the tree snapshot and the transcript
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Upper bound on any single remote call made while reconciling
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".chat-tree-sync")
}

fn default_call_timeout() -> u64 {
    60
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            token: None,
            branch: default_branch(),
            api_url: default_api_url(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl GitHubConfig {
    /// Owner, repository and token are all set.
    pub fn is_configured(&self) -> bool {
        !self.owner.is_empty()
            && !self.repo.is_empty()
            && self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content)?;
        info!(
            owner = %config.github.owner,
            repo = %config.github.repo,
            branch = %config.github.branch,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Load from an optional file, then apply `GITHUB_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Override GitHub settings from `lookup` (`GITHUB_TOKEN`, `GITHUB_OWNER`,
    /// `GITHUB_REPO`, `GITHUB_BRANCH`). Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        if let Some(token) = get("GITHUB_TOKEN") {
            self.github.token = Some(token);
        }
        if let Some(owner) = get("GITHUB_OWNER") {
            self.github.owner = owner;
        }
        if let Some(repo) = get("GITHUB_REPO") {
            self.github.repo = repo;
        }
        if let Some(branch) = get("GITHUB_BRANCH") {
            self.github.branch = branch;
        }
    }
}
