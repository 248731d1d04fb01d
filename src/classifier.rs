//! Turns raw chat input into an [`Instruction`].
//!
//! Two recognizers run in order: a strict JSON parse (tree replacement), then a
//! tagged-block extractor for single-file edits:
//!
//! ```text
//! Fichier: src/util.js
//! function add(a, b) { return a + b; }
//! Resumer: adds two numbers
//! ```
//!
//! The code body starts after the first line containing `fichier:` in any
//! case, not necessarily the line the path was taken from. Any text that
//! mentions the marker above the `Fichier:` line moves the body start up.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::tree::split_path;

static FILE_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^Fichier:\s*(.+)$").expect("file marker pattern"));
static SUMMARY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?im)^Resumer:\s*(.+)$").expect("summary marker pattern"));

const FILE_MARKER: &str = "fichier:";

pub const UNRECOGNIZED_INPUT: &str =
    "input is neither valid JSON nor a recognized file/summary block.";

/// A classified user instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Replace the whole tree with the one described by this JSON mapping.
    TreeReplace(Value),
    /// Create or overwrite one file.
    FileEdit {
        path: String,
        content: String,
        summary: String,
    },
    /// Not actionable.
    Invalid(String),
}

impl Instruction {
    /// Short label used in log fields.
    pub fn label(&self) -> &'static str {
        match self {
            Instruction::TreeReplace(_) => "tree_replace",
            Instruction::FileEdit { .. } => "file_edit",
            Instruction::Invalid(_) => "invalid",
        }
    }
}

/// Classify raw input text.
pub fn classify(text: &str) -> Instruction {
    if let Ok(layout) = serde_json::from_str::<Value>(text) {
        if is_truthy(&layout) {
            return Instruction::TreeReplace(layout);
        }
    }

    parse_file_block(text).unwrap_or_else(|| Instruction::Invalid(UNRECOGNIZED_INPUT.to_string()))
}

// `null`, `false`, `0` and `""` parse as JSON but never describe a tree.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn parse_file_block(text: &str) -> Option<Instruction> {
    let file = FILE_LINE.captures(text)?;
    let summary = SUMMARY_LINE.captures(text)?;

    let path = file.get(1)?.as_str().trim();
    let summary_line = summary.get(0)?;
    let summary = summary.get(1)?.as_str().trim();
    let content = extract_body(&text[..summary_line.start()]);

    let invalid = |reason: String| Some(Instruction::Invalid(reason));
    if split_path(path).is_empty() {
        return invalid(format!("file path '{}' names no file", path));
    }
    if content.is_empty() {
        return invalid(format!("file block for '{}' has no code", path));
    }
    if summary.is_empty() {
        return invalid(format!("file block for '{}' has no summary", path));
    }

    Some(Instruction::FileEdit {
        path: path.to_string(),
        content,
        summary: summary.to_string(),
    })
}

fn extract_body(before_summary: &str) -> String {
    let lines: Vec<&str> = before_summary.split('\n').collect();
    let start = lines
        .iter()
        .position(|line| line.to_lowercase().contains(FILE_MARKER))
        .map_or(0, |i| i + 1);
    lines[start..].join("\n").trim().to_string()
}
