//! Typed identifiers for units of deferred computation.
//!
//! A [`JobKey`] names one job within a changeset. It is used directly as an
//! in-memory map key by the runner and is stored in `changeseterrors` as
//! typed columns `(job_kind, file, block, sha1)` rather than a serialized
//! string.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKey {
    /// Populate `changesetfiles` for the changeset.
    Structure,
    /// Read both sides of a changed file and create its file difference.
    Examine { file: i64 },
    /// Compute the line-level blocks of an eligible file difference.
    Compare { file: i64 },
    /// Intra-line analysis of one block.
    Analyze { file: i64, block: i64 },
    /// Tokenize one shared highlight entry.
    Highlight { highlight_file: i64, sha1: String },
}

impl JobKey {
    pub fn kind(&self) -> &'static str {
        match self {
            JobKey::Structure => "structure",
            JobKey::Examine { .. } => "examine",
            JobKey::Compare { .. } => "compare",
            JobKey::Analyze { .. } => "analyze",
            JobKey::Highlight { .. } => "highlight",
        }
    }

    /// Flattens the key into the `(job_kind, file, block, sha1)` columns.
    pub fn to_columns(&self) -> (&'static str, i64, i64, &str) {
        match self {
            JobKey::Structure => (self.kind(), 0, 0, ""),
            JobKey::Examine { file } | JobKey::Compare { file } => (self.kind(), *file, 0, ""),
            JobKey::Analyze { file, block } => (self.kind(), *file, *block, ""),
            JobKey::Highlight { highlight_file, sha1 } => {
                (self.kind(), *highlight_file, 0, sha1.as_str())
            }
        }
    }

    /// Inverse of [`JobKey::to_columns`]. Returns `None` for unknown kinds.
    pub fn from_columns(kind: &str, file: i64, block: i64, sha1: String) -> Option<Self> {
        let key = match kind {
            "structure" => JobKey::Structure,
            "examine" => JobKey::Examine { file },
            "compare" => JobKey::Compare { file },
            "analyze" => JobKey::Analyze { file, block },
            "highlight" => JobKey::Highlight { highlight_file: file, sha1 },
            _ => return None,
        };
        Some(key)
    }

    /// Jobs whose failure leaves the structure or content diff unusable.
    ///
    /// Analysis and highlighting only degrade presentation.
    pub fn affects_diff(&self) -> bool {
        matches!(self, JobKey::Structure | JobKey::Examine { .. } | JobKey::Compare { .. })
    }

    /// Jobs that write below a content-difference anchor and are void once
    /// that anchor is collected.
    pub fn writes_content(&self) -> bool {
        matches!(self, JobKey::Examine { .. } | JobKey::Compare { .. } | JobKey::Analyze { .. })
    }
}

/// A journaled job failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobErrorRecord {
    pub key: JobKey,
    pub fatal: bool,
    pub traceback: String,
}
