//! Owned data types returned by the git read layer.
//!
//! Everything here is fully owned and `Send`, so results can leave the
//! thread that owns the `git2::Repository`.

/// Parents and root tree of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha1: String,
    /// Parent commit ids, in order. Empty for a root commit.
    pub parents: Vec<String>,
    pub tree: String,
}

impl CommitInfo {
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }
}

/// One path that differs between two trees.
///
/// A side that does not exist has both its sha1 and mode set to `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeChange {
    pub path: String,
    pub old_sha1: Option<String>,
    pub old_mode: Option<i64>,
    pub new_sha1: Option<String>,
    pub new_mode: Option<i64>,
}
