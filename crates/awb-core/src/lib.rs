use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContractError {
    #[error("snapshot entry missing required field: {field}")]
    MissingField { field: &'static str },
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Classification of a single line in a computed diff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Deleted,
    Unchanged,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Added => "added",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Unchanged => "unchanged",
        }
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, ChangeKind::Unchanged)
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "added" => Ok(ChangeKind::Added),
            "deleted" | "removed" => Ok(ChangeKind::Deleted),
            "unchanged" => Ok(ChangeKind::Unchanged),
            other => Err(format!("Unknown change kind: {other}")),
        }
    }
}

/// One line of a computed diff.
///
/// `line_number` is the line's position in the resulting (new) document for
/// `Added`/`Unchanged` lines. `Deleted` lines carry the position they would
/// have occupied relative to their neighbors without consuming a slot, so
/// the non-deleted lines of any diff number 1,2,3,… with no gaps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LineChange {
    pub kind: ChangeKind,
    pub text: String,
    pub line_number: usize,
}

/// A contiguous run of diff lines plus surrounding context.
///
/// Blocks are produced in ascending `start_line` order and never overlap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiffBlock {
    pub changes: Vec<LineChange>,
    pub start_line: usize,
    pub end_line: usize,
    pub has_changes: bool,
}

/// Whole-diff counts, computed over the full change list.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub additions: usize,
    pub deletions: usize,
    pub unchanged: usize,
}

impl DiffSummary {
    pub fn total(&self) -> usize {
        self.additions + self.deletions + self.unchanged
    }

    pub fn has_changes(&self) -> bool {
        self.additions > 0 || self.deletions > 0
    }
}

/// A persisted "last viewed" snapshot of one document within one session.
///
/// This is the JSON shape written to the key-value store. A stored entry
/// with any required field missing or empty is corrupt and gets purged on
/// read; `content` may be the empty string but the field must be present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub file_path: String,
    pub session_id: String,
    pub content: String,
    /// RFC 3339 timestamp of the last recorded view.
    pub viewed_at: String,
}

impl CacheEntry {
    pub fn new(
        session_id: impl Into<String>,
        file_path: impl Into<String>,
        content: impl Into<String>,
        viewed_at: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            session_id: session_id.into(),
            content: content.into(),
            viewed_at: viewed_at.to_rfc3339(),
        }
    }

    /// Structural validity check applied on every cache read.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.file_path.is_empty() {
            return Err(ContractError::MissingField { field: "filePath" });
        }
        if self.session_id.is_empty() {
            return Err(ContractError::MissingField { field: "sessionId" });
        }
        if self.viewed_at.is_empty() {
            return Err(ContractError::MissingField { field: "viewedAt" });
        }
        Ok(())
    }
}

/// Cache occupancy figures, recomputed on demand by scanning storage.
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub total_entries: usize,
    pub session_entries: usize,
    pub estimated_bytes: usize,
}
