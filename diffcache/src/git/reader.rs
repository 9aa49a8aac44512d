//! Read access to a repository through git2.
//!
//! git2::Repository is !Send, so a `GitReader` must be opened on the thread
//! that uses it. Workers keep one per repository for their lifetime.

use git2::{DiffOptions, Oid, Repository};

use crate::git::types::{CommitInfo, TreeChange};

pub struct GitReader {
    repo: Repository,
}

impl GitReader {
    pub fn open(path: &str) -> Result<Self, git2::Error> {
        Ok(GitReader { repo: Repository::open(path)? })
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    /// Resolves a revision expression (`HEAD~2`, a branch name, an
    /// abbreviated id) to a full commit id.
    pub fn resolve(&self, rev: &str) -> Result<String, git2::Error> {
        let commit = self.repo.revparse_single(rev)?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn read_commit(&self, sha1: &str) -> Result<CommitInfo, git2::Error> {
        let commit = self.repo.find_commit(Oid::from_str(sha1)?)?;
        Ok(CommitInfo {
            sha1: commit.id().to_string(),
            parents: commit.parent_ids().map(|id| id.to_string()).collect(),
            tree: commit.tree_id().to_string(),
        })
    }

    pub fn read_blob(&self, sha1: &str) -> Result<Vec<u8>, git2::Error> {
        let blob = self.repo.find_blob(Oid::from_str(sha1)?)?;
        Ok(blob.content().to_vec())
    }

    /// Compares the trees of two commits. `old = None` compares against the
    /// empty tree.
    ///
    /// Type changes (file to symlink and back) are reported as one entry so
    /// a path appears at most once. Renames are not detected: a moved file is
    /// a removal plus an addition.
    pub fn diff_trees(&self, old: Option<&str>, new: &str) -> Result<Vec<TreeChange>, git2::Error> {
        let old_tree = match old {
            Some(sha1) => Some(self.repo.find_commit(Oid::from_str(sha1)?)?.tree()?),
            None => None,
        };
        let new_tree = self.repo.find_commit(Oid::from_str(new)?)?.tree()?;

        let mut opts = DiffOptions::new();
        opts.include_typechange(true).ignore_submodules(false);
        let diff = self.repo.diff_tree_to_tree(old_tree.as_ref(), Some(&new_tree), Some(&mut opts))?;

        let mut changes = Vec::with_capacity(diff.deltas().len());
        for delta in diff.deltas() {
            let old_file = delta.old_file();
            let new_file = delta.new_file();
            let path = new_file
                .path()
                .or_else(|| old_file.path())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (old_sha1, old_mode) = side(&old_file);
            let (new_sha1, new_mode) = side(&new_file);
            changes.push(TreeChange { path, old_sha1, old_mode, new_sha1, new_mode });
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    /// Best common ancestor of all `commits`, or `None` for unrelated
    /// histories.
    pub fn merge_base(&self, commits: &[String]) -> Result<Option<String>, git2::Error> {
        let oids = commits.iter().map(|sha1| Oid::from_str(sha1)).collect::<Result<Vec<_>, _>>()?;
        match self.repo.merge_base_many(&oids) {
            Ok(oid) => Ok(Some(oid.to_string())),
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// `(sha1, mode)` of one side of a delta; the zero id marks a missing side.
fn side(file: &git2::DiffFile<'_>) -> (Option<String>, Option<i64>) {
    if file.id().is_zero() {
        (None, None)
    } else {
        (Some(file.id().to_string()), Some(i64::from(i32::from(file.mode()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::TestRepo;

    #[test]
    fn root_commit_diffs_against_empty_tree() {
        let repo = TestRepo::new();
        let root = repo.commit(&[("a.txt", "one\n"), ("dir/b.txt", "two\n")], &[]);
        let reader = GitReader::open(repo.path()).unwrap();

        let info = reader.read_commit(&root).unwrap();
        assert!(info.parents.is_empty());

        let changes = reader.diff_trees(None, &root).unwrap();
        let paths: Vec<_> = changes.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, ["a.txt", "dir/b.txt"]);
        assert!(changes.iter().all(|c| c.old_sha1.is_none() && c.new_mode == Some(0o100644)));
        assert_eq!(reader.read_blob(changes[0].new_sha1.as_ref().unwrap()).unwrap(), b"one\n");
    }

    #[test]
    fn merge_base_of_diverged_branches() {
        let repo = TestRepo::new();
        let base = repo.commit(&[("a.txt", "a\n")], &[]);
        let left = repo.commit(&[("a.txt", "left\n")], &[&base]);
        let right = repo.commit(&[("a.txt", "a\n"), ("b.txt", "b\n")], &[&base]);
        let reader = GitReader::open(repo.path()).unwrap();

        assert_eq!(reader.merge_base(&[left.clone(), right]).unwrap(), Some(base.clone()));
        let changes = reader.diff_trees(Some(&base), &left).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].old_sha1.is_some() && changes[0].new_sha1.is_some());
    }
}
