//! Remote repository access.
//!
//! The reconciler only sees [`RepositoryGateway`]; [`GitHubGateway`] implements
//! it on top of the GitHub REST API:
//!
//! - `GET  /repos/{owner}/{repo}/git/trees/{branch}?recursive=1`
//! - `GET  /repos/{owner}/{repo}/contents/{path}?ref={branch}`
//! - `PUT  /repos/{owner}/{repo}/contents/{path}` with `{message, content, sha?, branch}`

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::GitHubConfig;
use crate::tree::{split_path, NodeKind, TreeNode};

const GITHUB_JSON: &str = "application/vnd.github+json";
const USER_AGENT: &str = concat!("chat-tree-sync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("missing GitHub token")]
    MissingToken,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("GitHub API error {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// The three remote operations the reconciler needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RepositoryGateway: Send + Sync {
    /// Full recursive listing of the target branch as a tree with empty file
    /// bodies. `None` when the listing cannot be obtained.
    async fn fetch_tree(&self) -> Option<TreeNode>;

    /// Whether `path` exists remotely. Anything other than a clear "found"
    /// answer is reported as `false`.
    async fn path_exists(&self, path: &str) -> bool;

    /// Create or update `path` with `content`.
    async fn write_file(&self, path: &str, content: &str) -> Result<(), GatewayError>;
}

#[derive(Debug, Deserialize)]
struct TreeListing {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    entry_type: String,
}

#[derive(Debug, Deserialize)]
struct ContentMeta {
    sha: String,
}

#[derive(Debug, Serialize)]
struct PutContents<'a> {
    message: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
    branch: &'a str,
}

/// GitHub REST implementation of [`RepositoryGateway`].
pub struct GitHubGateway {
    client: Client,
    api_url: String,
    owner: String,
    repo: String,
    token: String,
    branch: String,
    max_retries: u32,
    retry_backoff: Duration,
}

impl GitHubGateway {
    pub fn new(config: &GitHubConfig) -> Result<Self, GatewayError> {
        let token = config
            .token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(GatewayError::MissingToken)?;

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            token,
            branch: config.branch.clone(),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    /// Build a gateway only when owner, repository and token are all present.
    pub fn from_config(config: &GitHubConfig) -> Option<Self> {
        if !config.is_configured() {
            return None;
        }
        match Self::new(config) {
            Ok(gateway) => Some(gateway),
            Err(e) => {
                error!(error = %e, "failed to create GitHub client");
                None
            }
        }
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    fn repo_url(&self, tail: &str) -> String {
        format!("{}/repos/{}/{}/{}", self.api_url, self.owner, self.repo, tail)
    }

    fn tree_url(&self) -> String {
        self.repo_url(&format!("git/trees/{}", self.branch))
    }

    fn contents_url(&self, path: &str) -> String {
        let encoded: Vec<_> = split_path(path)
            .into_iter()
            .map(urlencoding::encode)
            .collect();
        self.repo_url(&format!("contents/{}", encoded.join("/")))
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header(AUTHORIZATION, format!("token {}", self.token))
            .header(ACCEPT, GITHUB_JSON)
    }

    /// Whether `outcome` is a transient failure worth another attempt.
    fn should_retry(&self, outcome: &Result<Response, reqwest::Error>, attempt: u32) -> bool {
        let transient = match outcome {
            Ok(resp) => is_transient(resp.status()),
            Err(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        };
        transient && attempt < self.max_retries
    }

    async fn back_off(&self, attempt: u32) {
        let delay = self.retry_backoff * 2u32.saturating_pow(attempt);
        warn!(
            attempt = attempt + 1,
            max_retries = self.max_retries,
            delay_ms = delay.as_millis() as u64,
            "transient GitHub failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }

    /// Send, retrying transport failures, 5xx and 429 with exponential backoff.
    /// Any other response is returned as is for the caller to judge. Only for
    /// requests that can be repeated unchanged.
    async fn send_with_retry<F>(&self, build: F) -> Result<Response, GatewayError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0;
        loop {
            let outcome = build().send().await;
            if !self.should_retry(&outcome, attempt) {
                return outcome.map_err(GatewayError::from);
            }
            self.back_off(attempt).await;
            attempt += 1;
        }
    }

    async fn fetch_listing(&self) -> Result<TreeListing, GatewayError> {
        let url = self.tree_url();
        let resp = self
            .send_with_retry(|| self.request(Method::GET, &url).query(&[("recursive", "1")]))
            .await?;
        json_body(resp).await
    }

    /// Revision marker of the current remote content, if the file exists.
    async fn current_sha(&self, url: &str) -> Option<String> {
        let resp = self
            .send_with_retry(|| {
                self.request(Method::GET, url)
                    .query(&[("ref", self.branch.as_str())])
            })
            .await
            .ok()?;
        json_body::<ContentMeta>(resp).await.ok().map(|meta| meta.sha)
    }
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

async fn json_body<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, GatewayError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(GatewayError::Status { status, body });
    }
    Ok(serde_json::from_str(&body)?)
}

/// Rebuild a tree from a flat recursive listing. Entries that clash with
/// earlier ones are skipped.
fn tree_from_listing(listing: &TreeListing) -> TreeNode {
    let mut root = TreeNode::root();
    for entry in &listing.tree {
        let kind = if entry.entry_type == "blob" {
            NodeKind::File
        } else {
            NodeKind::Directory
        };
        if let Err(e) = root.insert_path(&split_path(&entry.path), kind) {
            warn!(path = %entry.path, error = %e, "skipping conflicting tree entry");
        }
    }
    root
}

#[async_trait]
impl RepositoryGateway for GitHubGateway {
    async fn fetch_tree(&self) -> Option<TreeNode> {
        match self.fetch_listing().await {
            Ok(listing) => {
                if listing.truncated {
                    warn!(branch = %self.branch, "GitHub truncated the tree listing");
                }
                info!(branch = %self.branch, entries = listing.tree.len(), "fetched repository tree");
                Some(tree_from_listing(&listing))
            }
            Err(e) => {
                error!(branch = %self.branch, error = %e, "failed to fetch repository tree");
                None
            }
        }
    }

    async fn path_exists(&self, path: &str) -> bool {
        let url = self.contents_url(path);
        let resp = self
            .send_with_retry(|| {
                self.request(Method::GET, &url)
                    .query(&[("ref", self.branch.as_str())])
            })
            .await;

        match resp {
            Ok(resp) if resp.status() == StatusCode::OK => true,
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => false,
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                warn!(path, %status, body = %body, "unexpected status checking path, assuming absent");
                false
            }
            Err(e) => {
                warn!(path, error = %e, "failed to check path, assuming absent");
                false
            }
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), GatewayError> {
        let url = self.contents_url(path);
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);

        let mut attempt = 0;
        let (resp, created) = loop {
            // A PUT that failed transiently may still have landed, which moves
            // the sha; look it up again on every attempt.
            let sha = self.current_sha(&url).await;
            let created = sha.is_none();
            debug!(path, attempt, created, "uploading file");

            let body = PutContents {
                message: format!("Update file {}", path),
                content: encoded.clone(),
                sha,
                branch: &self.branch,
            };
            let outcome = self.request(Method::PUT, &url).json(&body).send().await;
            if !self.should_retry(&outcome, attempt) {
                break (outcome?, created);
            }
            self.back_off(attempt).await;
            attempt += 1;
        };

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            error!(path, %status, "GitHub rejected file update");
            return Err(GatewayError::Status { status, body });
        }

        info!(path, created, "file written to GitHub");
        Ok(())
    }
}
