//! Headless chat loop: owns the current tree and the message list, feeds each
//! user message through the classifier and the reconciler, and answers with
//! either the redacted tree or an error.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::classifier::classify;
use crate::gateway::RepositoryGateway;
use crate::reconcile::{ReconcileError, Reconciler, DEFAULT_CALL_TIMEOUT};
use crate::snapshot::TreeSnapshot;
use crate::summary::render_summary;
use crate::transcript::{ChatMessage, Role, TranscriptError, TranscriptStore};
use crate::tree::TreeNode;

pub struct ChatSession {
    tree: Option<TreeNode>,
    messages: Vec<ChatMessage>,
    gateway: Option<Arc<dyn RepositoryGateway>>,
    call_timeout: Duration,
    transcript: Option<TranscriptStore>,
    snapshot: Option<TreeSnapshot>,
}

impl ChatSession {
    pub fn new(gateway: Option<Arc<dyn RepositoryGateway>>) -> Self {
        Self {
            tree: None,
            messages: Vec::new(),
            gateway,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            transcript: None,
            snapshot: None,
        }
    }

    pub fn with_tree(mut self, tree: Option<TreeNode>) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Resume from, and keep writing to, a transcript and a tree snapshot.
    pub fn with_persistence(
        mut self,
        transcript: TranscriptStore,
        snapshot: TreeSnapshot,
    ) -> Result<Self, TranscriptError> {
        self.messages = transcript.load_all()?;
        if let Some(tree) = snapshot.load()? {
            self.tree = Some(tree);
        }
        info!(
            messages = self.messages.len(),
            has_tree = self.tree.is_some(),
            "chat session restored"
        );
        self.transcript = Some(transcript);
        self.snapshot = Some(snapshot);
        Ok(self)
    }

    pub fn tree(&self) -> Option<&TreeNode> {
        self.tree.as_ref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn has_remote(&self) -> bool {
        self.gateway.is_some()
    }

    /// Handle one user message and return the system reply. Blank input is
    /// ignored and yields `None`.
    pub async fn send(&mut self, input: &str) -> Option<&ChatMessage> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        self.record(Role::User, input);

        let outcome = Reconciler::new(self.gateway.as_deref())
            .with_call_timeout(self.call_timeout)
            .reconcile(classify(input), self.tree.as_ref())
            .await;

        let reply = match outcome {
            Ok(tree) => {
                let reply = render_summary(&tree);
                self.replace_tree(tree);
                reply
            }
            Err(e) => {
                warn!(error = %e, "instruction failed");
                format!("Error: {}", e)
            }
        };
        self.record(Role::System, reply);
        self.messages.last()
    }

    /// Replace the local tree with a fresh remote listing.
    pub async fn refresh_from_remote(&mut self) -> Result<&TreeNode, ReconcileError> {
        let gateway = self
            .gateway
            .clone()
            .ok_or(ReconcileError::MissingCredentials)?;
        let fetched = tokio::time::timeout(self.call_timeout, gateway.fetch_tree())
            .await
            .map_err(|_| {
                ReconcileError::RemoteUnavailable(format!(
                    "fetch_tree timed out after {:?}",
                    self.call_timeout
                ))
            })?
            .ok_or_else(|| {
                ReconcileError::RemoteUnavailable("could not fetch the repository tree".to_string())
            })?;
        Ok(self.replace_tree(fetched))
    }

    fn replace_tree(&mut self, tree: TreeNode) -> &TreeNode {
        if let Some(snapshot) = &self.snapshot {
            if let Err(e) = snapshot.save(&tree) {
                warn!(path = %snapshot.path().display(), error = %e, "failed to save tree snapshot");
            }
        }
        self.tree.insert(tree)
    }

    fn record(&mut self, role: Role, content: impl Into<String>) {
        let parent = self.messages.last().map(|m| m.id.clone());
        let message = ChatMessage::new(role, content, parent);
        if let Some(transcript) = &self.transcript {
            if let Err(e) = transcript.append(&message) {
                warn!(path = %transcript.path().display(), error = %e, "failed to append to transcript");
            }
        }
        self.messages.push(message);
    }
}
