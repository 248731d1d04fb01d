//! Redacted views of a tree: names, kinds and file summaries, no bodies.

use std::sync::Arc;

use crate::tree::TreeNode;

/// Copy of `tree` with every file body removed. Non-empty summaries are kept.
pub fn project_summary_only(tree: &TreeNode) -> TreeNode {
    match tree {
        TreeNode::Directory { name, children } => TreeNode::Directory {
            name: name.clone(),
            children: children
                .iter()
                .map(|child| Arc::new(project_summary_only(child)))
                .collect(),
        },
        TreeNode::File { name, summary, .. } => TreeNode::File {
            name: name.clone(),
            content: String::new(),
            summary: summary.clone().filter(|s| !s.is_empty()),
        },
    }
}

/// Pretty JSON of the summary projection, as shown back to the user.
pub fn render_summary(tree: &TreeNode) -> String {
    // A tree of strings always serializes.
    serde_json::to_string_pretty(&project_summary_only(tree)).unwrap_or_default()
}
