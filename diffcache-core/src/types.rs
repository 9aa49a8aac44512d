use serde::{Deserialize, Serialize};

/// Git mode bits for a regular file; `(mode & MODE_TYPE_MASK) == MODE_REGULAR`.
pub const MODE_REGULAR: i64 = 0o100000;
/// Git mode bits for a symbolic link.
pub const MODE_SYMLINK: i64 = 0o120000;
/// Git mode bits for a submodule (gitlink) entry.
pub const MODE_GITLINK: i64 = 0o160000;
/// Mask selecting the object-type bits of a git mode.
pub const MODE_TYPE_MASK: i64 = 0o170000;

/// A repository registered with the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub path: String,
}

/// A cached comparison between two commits.
///
/// Identity is `(repository, to_commit, from_commit)` for regular changesets
/// and `(repository, to_commit, from_commit, for_merge)` for changesets
/// scoped to one side of a merge. `processed` and `complete` only ever move
/// from `false` to `true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Changeset {
    pub id: i64,
    pub repository: i64,
    pub to_commit: String,
    pub from_commit: Option<String>,
    pub for_merge: Option<String>,
    pub is_replay: bool,
    pub processed: bool,
    pub complete: bool,
}

/// One entry of a structure diff.
///
/// A missing side (both sha1 and mode `None`) means the file was added or
/// removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangedFile {
    pub file: i64,
    pub path: String,
    pub old_sha1: Option<String>,
    pub old_mode: Option<i64>,
    pub new_sha1: Option<String>,
    pub new_mode: Option<i64>,
}

impl ChangedFile {
    pub fn is_added(&self) -> bool {
        self.old_sha1.is_none() && self.new_sha1.is_some()
    }

    pub fn is_removed(&self) -> bool {
        self.old_sha1.is_some() && self.new_sha1.is_none()
    }

    /// Both sides exist and their content differs.
    pub fn is_modified(&self) -> bool {
        matches!((&self.old_sha1, &self.new_sha1), (Some(old), Some(new)) if old != new)
    }

    /// True when the ORed modes of both sides still describe a regular file,
    /// i.e. neither side is a symlink or submodule.
    pub fn is_regular(&self) -> bool {
        let mode = self.old_mode.unwrap_or(0) | self.new_mode.unwrap_or(0);
        mode & MODE_TYPE_MASK == MODE_REGULAR
    }
}

/// Cache anchor for a changeset's content diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentDifference {
    pub changeset: i64,
    /// Last time the content diff was requested (Unix seconds).
    pub requested: i64,
    pub complete: bool,
}

/// Whether a changeset's file versions should be syntax highlighted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChangesetHighlightRequest {
    pub changeset: i64,
    pub requested: bool,
    /// Set once every changed file has been examined with highlighting on,
    /// so all entries the changeset needs exist.
    pub evaluated: bool,
}

/// Per-side facts recorded when a file is examined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct FileSide {
    pub is_binary: bool,
    /// Number of lines; zero for binary content.
    pub length: i64,
    /// Whether the content ends with a line break.
    pub linebreak: bool,
    pub highlight_file: Option<i64>,
}

/// Content-diff state of one changed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDifference {
    pub changeset: i64,
    pub file: i64,
    pub path: String,
    pub comparison_pending: bool,
    pub old: Option<FileSide>,
    pub new: Option<FileSide>,
}

/// A contiguous replacement inside a file difference.
///
/// `offset` counts unchanged lines since the end of the previous block (or
/// the start of the file). The `*_length` fields include any unchanged
/// context lines folded into the block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedLineBlock {
    pub index: i64,
    pub offset: i64,
    pub delete_count: i64,
    pub delete_length: i64,
    pub insert_count: i64,
    pub insert_length: i64,
    /// `None` = not analyzed yet, `Some("")` = nothing to analyze.
    pub analysis: Option<String>,
}

impl ChangedLineBlock {
    /// Blocks with an empty side never need intra-line analysis.
    pub fn needs_analysis(&self) -> bool {
        self.delete_count > 0 && self.insert_count > 0
    }
}

/// Highlight lifecycle of one file version.
///
/// The stored pair `(requested, highlighted)` is never `(true, true)`;
/// this enum is the only shape the rest of the crate sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HighlightState {
    Requested,
    Highlighted,
    /// Neither requested nor highlighted: never asked for, or the language
    /// could not be detected.
    Idle,
}

impl HighlightState {
    pub fn from_flags(requested: bool, highlighted: bool) -> Self {
        match (requested, highlighted) {
            (_, true) => HighlightState::Highlighted,
            (true, false) => HighlightState::Requested,
            (false, false) => HighlightState::Idle,
        }
    }
}

/// Identity of a highlight entry as requested, before it has a row id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HighlightKey {
    pub sha1: String,
    pub language: Option<String>,
    pub conflicts: bool,
}

/// A shared highlight cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HighlightFile {
    pub id: i64,
    pub repository: i64,
    pub sha1: String,
    pub language: Option<String>,
    pub conflicts: bool,
    pub state: HighlightState,
}

/// One styled fragment of a highlighted line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fg: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub bold: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub italic: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub underline: bool,
}

/// A user-driven reference that keeps a highlight alive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomHighlightRequest {
    pub id: String, // UUID v4 text
    pub file: i64,
    pub last_access: i64,
}

/// Outcome of a merge (or rebase) replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReplayState {
    Pending,
    Replayed(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReplayRequest {
    pub repository: i64,
    pub merge: String,
    /// Set for rebase replays: the commit the original is replayed onto.
    pub onto: Option<String>,
    pub state: ReplayState,
}

/// A language-aware label for a range of lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodeContext {
    pub first_line: i64,
    pub last_line: i64,
    pub context: String,
}
