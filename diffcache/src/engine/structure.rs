//! Structure difference: which paths changed between two commits.

use diffcache_core::changesets::{self, NewChangedFile};
use diffcache_core::types::Changeset;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::engine::error::ComputeError;
use crate::git::types::TreeChange;
use crate::git::GitReader;

/// Rows per insert transaction. Readers see partial results between
/// batches.
pub const BATCH_SIZE: usize = 256;

impl From<TreeChange> for NewChangedFile {
    fn from(change: TreeChange) -> Self {
        NewChangedFile {
            path: change.path,
            old_sha1: change.old_sha1,
            old_mode: change.old_mode,
            new_sha1: change.new_sha1,
            new_mode: change.new_mode,
        }
    }
}

/// Computes and stores the structure difference of `changeset`.
///
/// For the primary changeset of a merge (`for_merge == to_commit`), the
/// reference changeset `(from_commit, merge-base, merge)` is created and
/// computed too, and both are pruned to the paths they have in common.
pub fn compute(db: &mut Connection, git: &GitReader, changeset: &Changeset) -> Result<(), ComputeError> {
    if changeset.complete {
        return Ok(());
    }
    if changeset.for_merge.as_deref() == Some(changeset.to_commit.as_str()) {
        return compute_for_merge(db, git, changeset);
    }

    let from = match &changeset.from_commit {
        Some(from) => Some(from.clone()),
        None => {
            let commit = git.read_commit(&changeset.to_commit)?;
            if commit.is_merge() {
                return Err(ComputeError::FatalDiff(format!(
                    "{} is a merge; a parent must be given explicitly",
                    changeset.to_commit
                )));
            }
            commit.parents.into_iter().next()
        }
    };

    changesets::set_processed(db, changeset.id)?;
    let count = store_tree_diff(db, git, changeset.id, from.as_deref(), &changeset.to_commit)?;
    changesets::set_complete(db, changeset.id)?;
    info!(changeset = changeset.id, files = count, "structure difference complete");
    Ok(())
}

fn compute_for_merge(db: &mut Connection, git: &GitReader, primary: &Changeset) -> Result<(), ComputeError> {
    let merge = &primary.to_commit;
    let parent = primary.from_commit.as_deref().ok_or_else(|| {
        ComputeError::FatalDiff(format!("merge changeset for {merge} has no parent"))
    })?;
    let commit = git.read_commit(merge)?;
    if !commit.parents.iter().any(|p| p == parent) {
        return Err(ComputeError::FatalDiff(format!("{parent} is not a parent of {merge}")));
    }
    let base = git.merge_base(&commit.parents)?.ok_or_else(|| {
        ComputeError::FatalDiff(format!("parents of {merge} have no common ancestor"))
    })?;

    let reference =
        changesets::get_or_create(db, primary.repository, parent, Some(&base), Some(merge), false)?;
    debug!(changeset = primary.id, reference = reference.id, %base, "computing merge reference");

    changesets::set_processed(db, primary.id)?;
    store_tree_diff(db, git, primary.id, Some(parent), merge)?;
    changesets::set_processed(db, reference.id)?;
    store_tree_diff(db, git, reference.id, Some(&base), parent)?;
    changesets::prune_to_common_and_complete(db, primary.id, reference.id)?;

    info!(changeset = primary.id, reference = reference.id, "merge structure difference complete");
    Ok(())
}

fn store_tree_diff(
    db: &mut Connection,
    git: &GitReader,
    changeset: i64,
    from: Option<&str>,
    to: &str,
) -> Result<usize, ComputeError> {
    let changes = git.diff_trees(from, to)?;
    let total = changes.len();
    let mut batch = Vec::with_capacity(BATCH_SIZE.min(total));
    for change in changes {
        batch.push(NewChangedFile::from(change));
        if batch.len() == BATCH_SIZE {
            changesets::insert_files(db, changeset, &batch)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        changesets::insert_files(db, changeset, &batch)?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::TestRepo;
    use diffcache_core::{db, repositories};

    fn setup(repo: &TestRepo) -> (tempfile::TempDir, Connection, i64) {
        let dir = tempfile::TempDir::new().unwrap();
        let conn = db::open_sync(dir.path().join("cache.db")).unwrap();
        let id = repositories::register(&conn, "test", repo.path()).unwrap().id;
        (dir, conn, id)
    }

    #[test]
    fn added_file_has_no_old_side() {
        let repo = TestRepo::new();
        let base = repo.commit(&[("keep.txt", "x\n")], &[]);
        let head = repo.commit(&[("keep.txt", "x\n"), ("foo.txt", "1\n2\n3\n4\n5\n")], &[&base]);
        let (_dir, mut conn, repository) = setup(&repo);
        let git = GitReader::open(repo.path()).unwrap();

        let cs = changesets::get_or_create(&mut conn, repository, &head, None, None, false).unwrap();
        compute(&mut conn, &git, &cs).unwrap();

        let cs = changesets::fetch(&conn, cs.id).unwrap().unwrap();
        assert!(cs.processed && cs.complete);
        let files = changesets::structure_diff(&conn, cs.id).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "foo.txt");
        assert!(files[0].is_added());
        assert_eq!(files[0].old_mode, None);
    }

    #[test]
    fn merge_without_parent_is_fatal() {
        let repo = TestRepo::new();
        let base = repo.commit(&[("a", "a\n")], &[]);
        let left = repo.commit(&[("a", "l\n")], &[&base]);
        let right = repo.commit(&[("a", "a\n"), ("b", "b\n")], &[&base]);
        let merge = repo.commit(&[("a", "l\n"), ("b", "b\n")], &[&left, &right]);
        let (_dir, mut conn, repository) = setup(&repo);
        let git = GitReader::open(repo.path()).unwrap();

        let cs = changesets::get_or_create(&mut conn, repository, &merge, None, None, false).unwrap();
        let err = compute(&mut conn, &git, &cs).unwrap_err();
        assert!(matches!(err, ComputeError::FatalDiff(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn merge_changesets_keep_only_files_changed_on_both_sides() {
        let repo = TestRepo::new();
        let base = repo.commit(&[("both", "0\n"), ("left", "0\n"), ("right", "0\n")], &[]);
        let left = repo.commit(&[("both", "l\n"), ("left", "l\n"), ("right", "0\n")], &[&base]);
        let right = repo.commit(&[("both", "r\n"), ("left", "0\n"), ("right", "r\n")], &[&base]);
        let merge = repo.commit(&[("both", "m\n"), ("left", "l\n"), ("right", "r\n")], &[&left, &right]);
        let (_dir, mut conn, repository) = setup(&repo);
        let git = GitReader::open(repo.path()).unwrap();

        let primary =
            changesets::get_or_create(&mut conn, repository, &merge, Some(&left), Some(&merge), false)
                .unwrap();
        compute(&mut conn, &git, &primary).unwrap();

        let reference = changesets::find(&conn, repository, &left, Some(&base), Some(&merge))
            .unwrap()
            .expect("reference changeset");
        assert!(reference.complete);
        for id in [primary.id, reference.id] {
            let paths: Vec<_> =
                changesets::structure_diff(&conn, id).unwrap().into_iter().map(|f| f.path).collect();
            assert_eq!(paths, ["both"]);
        }

        // The regular changeset for the same commits is a separate identity.
        let regular =
            changesets::get_or_create(&mut conn, repository, &merge, Some(&left), None, false).unwrap();
        assert_ne!(regular.id, primary.id);
        compute(&mut conn, &git, &regular).unwrap();
        assert_eq!(changesets::structure_diff(&conn, regular.id).unwrap().len(), 2);
    }
}
