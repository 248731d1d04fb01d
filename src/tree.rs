//! In-memory file tree.
//!
//! Children are held behind `Arc` so that every mutation copies only the nodes
//! on the path it touches (`Arc::make_mut`) and shares everything else with the
//! previous value. A tree handed out by any operation here is never modified
//! afterwards, which is what lets the reconciler fall back to the caller's tree
//! when a later step fails.
//!
//! Serialized form:
//! ```json
//! {"name":"root","type":"directory","children":[
//!   {"name":"index.js","type":"file","content":"...","summary":"entry point"}
//! ]}
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Name of the directory every tree hangs from. It never appears in a path.
pub const ROOT_NAME: &str = "root";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Directory,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::File => f.write_str("file"),
            NodeKind::Directory => f.write_str("directory"),
        }
    }
}

/// A node of the virtual file tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeNode {
    Directory {
        name: String,
        #[serde(default)]
        children: Vec<Arc<TreeNode>>,
    },
    File {
        name: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("'{path}' already exists as a {found}")]
    KindConflict { path: String, found: NodeKind },
    #[error("path has no segments")]
    EmptyPath,
    #[error("'{segment}' is not a valid path segment")]
    InvalidSegment { segment: String },
}

/// Split a `/`-joined path into its segments, ignoring empty ones.
pub fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// A node name must be usable as one path segment on both sides of the
/// mirror: `.` and `..` would be normalized away in a URL, and a `/` would
/// split into several remote directories.
pub fn check_segment(segment: &str) -> Result<(), TreeError> {
    if segment.is_empty() || segment == "." || segment == ".." || segment.contains('/') {
        return Err(TreeError::InvalidSegment {
            segment: segment.to_string(),
        });
    }
    Ok(())
}

/// Split `path` and check every segment. A path with no segments is an error.
pub fn validate_path(path: &str) -> Result<Vec<&str>, TreeError> {
    let segments = split_path(path);
    if segments.is_empty() {
        return Err(TreeError::EmptyPath);
    }
    for segment in &segments {
        check_segment(segment)?;
    }
    Ok(segments)
}

impl TreeNode {
    /// An empty root directory.
    pub fn root() -> Self {
        Self::directory(ROOT_NAME)
    }

    pub fn directory(name: impl Into<String>) -> Self {
        TreeNode::Directory {
            name: name.into(),
            children: Vec::new(),
        }
    }

    pub fn file(name: impl Into<String>) -> Self {
        TreeNode::File {
            name: name.into(),
            content: String::new(),
            summary: None,
        }
    }

    fn empty(name: &str, kind: NodeKind) -> Self {
        match kind {
            NodeKind::File => Self::file(name),
            NodeKind::Directory => Self::directory(name),
        }
    }

    /// Build a tree from a nested JSON mapping: `null` values become empty
    /// files, anything else becomes a directory (empty unless it is a mapping).
    pub fn from_json(layout: &Value) -> Self {
        Self::convert_named(ROOT_NAME, layout)
    }

    fn convert_named(name: &str, layout: &Value) -> Self {
        let children = match layout {
            Value::Object(map) => map
                .iter()
                .map(|(key, value)| {
                    Arc::new(match value {
                        Value::Null => Self::file(key.as_str()),
                        nested => Self::convert_named(key, nested),
                    })
                })
                .collect(),
            _ => Vec::new(),
        };
        TreeNode::Directory {
            name: name.to_string(),
            children,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            TreeNode::Directory { name, .. } | TreeNode::File { name, .. } => name,
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            TreeNode::Directory { .. } => NodeKind::Directory,
            TreeNode::File { .. } => NodeKind::File,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind() == NodeKind::File
    }

    /// Body of a file node; `None` for directories.
    pub fn content(&self) -> Option<&str> {
        match self {
            TreeNode::File { content, .. } => Some(content),
            TreeNode::Directory { .. } => None,
        }
    }

    pub fn summary(&self) -> Option<&str> {
        match self {
            TreeNode::File { summary, .. } => summary.as_deref(),
            TreeNode::Directory { .. } => None,
        }
    }

    pub fn children(&self) -> &[Arc<TreeNode>] {
        match self {
            TreeNode::Directory { children, .. } => children,
            TreeNode::File { .. } => &[],
        }
    }

    /// Direct child by exact name.
    pub fn child(&self, name: &str) -> Option<&TreeNode> {
        self.children()
            .iter()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
    }

    /// Resolve a path below this node. Fails on a missing segment, on a file
    /// used as a directory, and on an empty path.
    pub fn find(&self, path: &str) -> Option<&TreeNode> {
        let segments = split_path(path);
        if segments.is_empty() {
            return None;
        }
        segments
            .iter()
            .try_fold(self, |node, segment| node.child(segment))
    }

    /// Walk `segments`, creating directories on the way and the last segment
    /// as `kind`. Existing nodes of the right kind are kept as they are.
    /// Nothing is inserted when a segment fails [`check_segment`].
    pub fn insert_path(&mut self, segments: &[&str], kind: NodeKind) -> Result<(), TreeError> {
        if segments.is_empty() {
            return Ok(());
        }
        for segment in segments {
            check_segment(segment)?;
        }
        self.insert_leaf(segments, kind).map(|_| ())
    }

    fn insert_leaf(&mut self, segments: &[&str], kind: NodeKind) -> Result<&TreeNode, TreeError> {
        let found = self.kind();
        match self {
            TreeNode::Directory { children, .. } => insert_into(children, segments, 0, kind),
            TreeNode::File { name, .. } => Err(TreeError::KindConflict {
                path: name.clone(),
                found,
            }),
        }
    }

    /// New tree with the file at `path` holding `content` and `summary`.
    /// `None` when `path` does not name an existing file; `self` is untouched
    /// either way.
    pub fn with_file_content(
        &self,
        path: &str,
        content: impl Into<String>,
        summary: impl Into<String>,
    ) -> Option<TreeNode> {
        if !self.find(path).is_some_and(TreeNode::is_file) {
            return None;
        }
        let mut root = self.clone();
        match root.node_mut(&split_path(path))? {
            TreeNode::File {
                content: body,
                summary: note,
                ..
            } => {
                *body = content.into();
                *note = Some(summary.into());
            }
            TreeNode::Directory { .. } => return None,
        }
        Some(root)
    }

    fn node_mut(&mut self, segments: &[&str]) -> Option<&mut TreeNode> {
        let Some((head, rest)) = segments.split_first() else {
            return Some(self);
        };
        let TreeNode::Directory { children, .. } = self else {
            return None;
        };
        let child = children.iter_mut().find(|c| c.name() == *head)?;
        Arc::make_mut(child).node_mut(rest)
    }

    /// New tree in which `path` exists as a file, creating missing directories
    /// and an empty file. Returns the file node and the new root.
    pub fn ensure_path(&self, path: &str) -> Result<(TreeNode, TreeNode), TreeError> {
        let segments = validate_path(path)?;
        let mut root = self.clone();
        let leaf = root.insert_leaf(&segments, NodeKind::File)?.clone();
        Ok((leaf, root))
    }

    /// Check every name below this node with [`check_segment`].
    pub fn check_names(&self) -> Result<(), TreeError> {
        for child in self.children() {
            check_segment(child.name())?;
            child.check_names()?;
        }
        Ok(())
    }

    /// Every file below this node as `(path, content)`, depth first in child
    /// order.
    pub fn files(&self) -> Vec<(String, &str)> {
        let mut out = Vec::new();
        self.collect_files("", &mut out);
        out
    }

    fn collect_files<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a str)>) {
        for child in self.children() {
            let path = if prefix.is_empty() {
                child.name().to_string()
            } else {
                format!("{}/{}", prefix, child.name())
            };
            match child.as_ref() {
                TreeNode::File { content, .. } => out.push((path, content.as_str())),
                dir => dir.collect_files(&path, out),
            }
        }
    }
}

fn insert_into<'a>(
    children: &'a mut Vec<Arc<TreeNode>>,
    segments: &[&str],
    depth: usize,
    kind: NodeKind,
) -> Result<&'a TreeNode, TreeError> {
    let head = segments[depth];
    let is_last = depth + 1 == segments.len();
    let wanted = if is_last { kind } else { NodeKind::Directory };

    let index = match children.iter().position(|c| c.name() == head) {
        Some(index) => index,
        None => {
            children.push(Arc::new(TreeNode::empty(head, wanted)));
            children.len() - 1
        }
    };

    let found = children[index].kind();
    if found != wanted {
        return Err(TreeError::KindConflict {
            path: segments[..=depth].join("/"),
            found,
        });
    }

    if is_last {
        let children: &'a Vec<Arc<TreeNode>> = children;
        return Ok(children[index].as_ref());
    }

    match Arc::make_mut(&mut children[index]) {
        TreeNode::Directory { children, .. } => insert_into(children, segments, depth + 1, kind),
        TreeNode::File { .. } => Err(TreeError::KindConflict {
            path: segments[..=depth].join("/"),
            found: NodeKind::File,
        }),
    }
}
