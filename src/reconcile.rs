//! Applies a classified instruction to the caller's tree and mirrors the
//! result to the remote repository.
//!
//! A file edit goes through a fixed decision table:
//!
//! | lookup                     | action                       |
//! |----------------------------|------------------------------|
//! | local hit                  | update in place              |
//! | local miss, remote hit     | materialize, then update     |
//! | local miss, remote miss    | materialize, then update     |
//!
//! The remote existence check never blocks creation; it only tells a stale
//! local tree apart from a genuinely new file in the logs. Local presence is
//! always checked before any remote call.
//!
//! The caller's tree is borrowed and never modified. On error the caller keeps
//! showing what it had; on success it replaces its tree with the returned one.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tracing::{error, info, warn};

use crate::classifier::Instruction;
use crate::gateway::RepositoryGateway;
use crate::tree::{validate_path, TreeError, TreeNode};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("the file is not in the local tree and no GitHub credentials are configured to look it up")]
    MissingCredentials,
    #[error("remote repository unavailable: {0}")]
    RemoteUnavailable(String),
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),
    #[error("invalid path: {0}")]
    InvalidPath(#[from] TreeError),
}

/// Where the target of a file edit was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    LocalHit,
    LocalMissRemoteHit,
    LocalMissRemoteMiss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditAction {
    UpdateInPlace,
    MaterializeThenUpdate,
}

impl Lookup {
    pub fn action(self) -> EditAction {
        match self {
            Lookup::LocalHit => EditAction::UpdateInPlace,
            Lookup::LocalMissRemoteHit | Lookup::LocalMissRemoteMiss => {
                EditAction::MaterializeThenUpdate
            }
        }
    }
}

pub struct Reconciler<'g> {
    gateway: Option<&'g dyn RepositoryGateway>,
    call_timeout: Duration,
}

impl<'g> Reconciler<'g> {
    /// `gateway` is `None` when no remote is configured; the reconciler then
    /// works purely locally and fails where a remote lookup is unavoidable.
    pub fn new(gateway: Option<&'g dyn RepositoryGateway>) -> Self {
        Self {
            gateway,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub async fn reconcile(
        &self,
        instruction: Instruction,
        tree: Option<&TreeNode>,
    ) -> Result<TreeNode, ReconcileError> {
        info!(
            instruction = instruction.label(),
            has_local_tree = tree.is_some(),
            has_remote = self.gateway.is_some(),
            "reconciling instruction"
        );

        match instruction {
            Instruction::TreeReplace(layout) => self.replace_tree(&layout).await,
            Instruction::FileEdit {
                path,
                content,
                summary,
            } => self.edit_file(tree, &path, &content, &summary).await,
            Instruction::Invalid(reason) => {
                warn!(reason = %reason, "rejecting invalid instruction");
                Err(ReconcileError::InvalidInput(reason))
            }
        }
    }

    async fn replace_tree(&self, layout: &Value) -> Result<TreeNode, ReconcileError> {
        let tree = TreeNode::from_json(layout);
        tree.check_names()?;
        if let Some(gateway) = self.gateway {
            let files = tree.files();
            info!(files = files.len(), "mirroring tree to remote");
            for (path, content) in files {
                self.write_through(gateway, &path, content).await?;
            }
        }
        Ok(tree)
    }

    async fn edit_file(
        &self,
        tree: Option<&TreeNode>,
        path: &str,
        content: &str,
        summary: &str,
    ) -> Result<TreeNode, ReconcileError> {
        validate_path(path)?;
        let fetched;
        let local = match tree {
            Some(tree) => tree,
            None => {
                let gateway = self.gateway.ok_or(ReconcileError::MissingCredentials)?;
                info!("no local tree, fetching it from the remote");
                fetched = self
                    .remote("fetch_tree", gateway.fetch_tree())
                    .await?
                    .ok_or_else(|| {
                        ReconcileError::RemoteUnavailable(
                            "could not fetch the repository tree".to_string(),
                        )
                    })?;
                &fetched
            }
        };

        let lookup = self.lookup(local, path).await?;
        let updated = match lookup.action() {
            EditAction::UpdateInPlace => local.with_file_content(path, content, summary),
            EditAction::MaterializeThenUpdate => {
                let (_, materialized) = local.ensure_path(path)?;
                materialized.with_file_content(path, content, summary)
            }
        }
        .ok_or_else(|| {
            error!(path, ?lookup, "file missing after it was resolved");
            ReconcileError::InternalInconsistency(format!(
                "'{}' does not resolve to a file after creation",
                path
            ))
        })?;

        if let Some(gateway) = self.gateway {
            self.write_through(gateway, path, content).await?;
        }
        Ok(updated)
    }

    async fn lookup(&self, local: &TreeNode, path: &str) -> Result<Lookup, ReconcileError> {
        if local.find(path).is_some_and(TreeNode::is_file) {
            return Ok(Lookup::LocalHit);
        }

        let gateway = self.gateway.ok_or(ReconcileError::MissingCredentials)?;
        let lookup = if self.remote("path_exists", gateway.path_exists(path)).await? {
            info!(path, "file exists remotely but is missing from the local tree");
            Lookup::LocalMissRemoteHit
        } else {
            info!(path, "creating new file");
            Lookup::LocalMissRemoteMiss
        };
        Ok(lookup)
    }

    async fn write_through(
        &self,
        gateway: &dyn RepositoryGateway,
        path: &str,
        content: &str,
    ) -> Result<(), ReconcileError> {
        self.remote("write_file", gateway.write_file(path, content))
            .await?
            .map_err(|e| {
                error!(path, error = %e, "write-through failed");
                ReconcileError::RemoteUnavailable(format!("failed to write '{}': {}", path, e))
            })
    }

    async fn remote<F: Future>(
        &self,
        operation: &'static str,
        call: F,
    ) -> Result<F::Output, ReconcileError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| {
                error!(operation, timeout_ms = self.call_timeout.as_millis() as u64, "remote call timed out");
                ReconcileError::RemoteUnavailable(format!(
                    "{} timed out after {:?}",
                    operation, self.call_timeout
                ))
            })
    }
}

/// Reconcile `instruction` against `tree` with the default call timeout.
pub async fn reconcile(
    instruction: Instruction,
    tree: Option<&TreeNode>,
    gateway: Option<&dyn RepositoryGateway>,
) -> Result<TreeNode, ReconcileError> {
    Reconciler::new(gateway).reconcile(instruction, tree).await
}
