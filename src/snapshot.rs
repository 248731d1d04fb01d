use std::fs;
use std::path::{Path, PathBuf};

use crate::tree::TreeNode;

const SNAPSHOT_FILE: &str = "tree.json";

/// Last accepted tree, persisted as pretty JSON so the caller keeps owning
/// it across process runs.
pub struct TreeSnapshot {
    path: PathBuf,
}

impl TreeSnapshot {
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(SNAPSHOT_FILE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when nothing has been saved yet.
    pub fn load(&self) -> std::io::Result<Option<TreeNode>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.path)?;
        let tree = serde_json::from_str(&data)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Some(tree))
    }

    pub fn save(&self, tree: &TreeNode) -> std::io::Result<()> {
        let data = serde_json::to_string_pretty(tree)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(&self.path, data)
    }

    pub fn clear(&self) -> std::io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
