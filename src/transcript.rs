//! Append-only JSONL chat transcript.
//!
//! Each line is one message; `parent_id` points at the message before it, so
//! the conversation can be replayed in order even if lines are concatenated
//! from several runs.
//!
//! ```jsonl
//! {"id":"a1","parent_id":null,"role":"user","content":"{\"src\":{}}","ts":1700000000}
//! {"id":"a2","parent_id":"a1","role":"system","content":"{...}","ts":1700000001}
//! ```

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    System,
}

/// A single chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub role: Role,
    pub content: String,
    pub ts: i64,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id,
            role,
            content: content.into(),
            ts: chrono::Utc::now().timestamp(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptError {
    #[error("transcript I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// JSONL file holding the transcript. Nothing is ever rewritten.
pub struct TranscriptStore {
    path: PathBuf,
}

impl TranscriptStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one message as a single line. The message is serialized before
    /// the file is touched, and a line left unterminated by an interrupted
    /// write is closed first so it cannot swallow the new message.
    pub fn append(&self, message: &ChatMessage) -> Result<(), TranscriptError> {
        let line = serde_json::to_string(message)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        let mut record = String::with_capacity(line.len() + 2);
        if file.metadata()?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                record.push('\n');
            }
        }
        record.push_str(&line);
        record.push('\n');
        file.write_all(record.as_bytes())?;
        Ok(())
    }

    /// Load every message, oldest first. A missing file is an empty transcript.
    /// Lines that do not parse are skipped with a warning.
    pub fn load_all(&self) -> Result<Vec<ChatMessage>, TranscriptError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChatMessage>(trimmed) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = index + 1,
                    error = %e,
                    "skipping unreadable transcript line"
                ),
            }
        }
        Ok(messages)
    }
}
