//! Merge and rebase replays.
//!
//! A replay redoes the merge (or cherry-pick) with git2 and commits the
//! result as-is, conflicts included, so the recorded resolution can be
//! diffed against it.

use std::path::Path;

use diffcache_core::types::MergeReplayRequest;
use diffcache_core::{changesets, replay};
use git2::{Commit, Index, IndexEntry, MergeFileOptions, Oid, Repository};
use rusqlite::Connection;
use tracing::{info, warn};

use crate::engine::error::ComputeError;
use crate::git::GitReader;

/// Stage bits of an index entry's flags.
const STAGE_MASK: u16 = 0x3000;

/// Runs one pending replay and records its outcome.
///
/// A replay that cannot be done is stored as a failure and is not an error
/// here; only store failures propagate, so busy databases are retried.
pub fn execute(
    db: &mut Connection,
    git: &GitReader,
    request: &MergeReplayRequest,
) -> Result<(), ComputeError> {
    match replay_commit(git.repository(), request) {
        Ok(oid) => {
            let sha1 = oid.to_string();
            if replay::store_success(db, request.repository, &request.merge, &sha1)? {
                let changeset = changesets::get_or_create(
                    db,
                    request.repository,
                    &request.merge,
                    Some(&sha1),
                    None,
                    true,
                )?;
                info!(merge = %request.merge, replay = %sha1, changeset = changeset.id, "replayed");
            }
            Ok(())
        }
        Err(err) if err.is_transient() => Err(err),
        Err(err) => {
            warn!(merge = %request.merge, error = %err, "replay failed");
            replay::store_failure(db, request.repository, &request.merge, &err.to_string())?;
            Ok(())
        }
    }
}

fn replay_commit(repo: &Repository, request: &MergeReplayRequest) -> Result<Oid, ComputeError> {
    let original = repo.find_commit(Oid::from_str(&request.merge)?)?;
    let (mut index, parents): (Index, Vec<Commit<'_>>) = match &request.onto {
        None => {
            if original.parent_count() != 2 {
                return Err(ComputeError::Replay(format!(
                    "{} has {} parents; only two-parent merges can be replayed",
                    original.id(),
                    original.parent_count()
                )));
            }
            let ours = original.parent(0)?;
            let theirs = original.parent(1)?;
            (repo.merge_commits(&ours, &theirs, None)?, vec![ours, theirs])
        }
        Some(onto) => {
            if original.parent_count() > 1 {
                return Err(ComputeError::Replay(format!("{} is a merge and cannot be rebased", original.id())));
            }
            let onto = repo.find_commit(Oid::from_str(onto)?)?;
            (repo.cherrypick_commit(&original, &onto, 0, None)?, vec![onto])
        }
    };

    if index.has_conflicts() {
        resolve_with_markers(repo, &mut index)?;
    }
    let tree = repo.find_tree(index.write_tree_to(repo)?)?;
    let parents: Vec<&Commit<'_>> = parents.iter().collect();
    let message = format!("Replay of {}\n", original.id());
    let oid = repo.commit(None, &original.author(), &original.committer(), &message, &tree, &parents)?;
    Ok(oid)
}

/// Replaces every conflict in `index` with a single entry. Content
/// conflicts become a blob with conflict markers; when one side deleted the
/// file, the surviving side is kept.
fn resolve_with_markers(repo: &Repository, index: &mut Index) -> Result<(), ComputeError> {
    let conflicts = index.conflicts()?.collect::<Result<Vec<_>, _>>()?;
    for conflict in conflicts {
        let resolved = match (&conflict.our, &conflict.their) {
            (Some(ours), Some(theirs)) => {
                // Both sides added the file: merge against an empty base.
                let empty;
                let ancestor = match &conflict.ancestor {
                    Some(ancestor) => ancestor,
                    None => {
                        empty = IndexEntry { id: repo.blob(b"")?, file_size: 0, ..copy_entry(ours) };
                        &empty
                    }
                };
                let mut opts = MergeFileOptions::new();
                opts.ancestor_label("base").our_label("ours").their_label("theirs");
                let merged = repo.merge_file_from_index(ancestor, ours, theirs, Some(&mut opts))?;
                let content = merged.content();
                IndexEntry {
                    id: repo.blob(content)?,
                    file_size: content.len() as u32,
                    mode: merged.mode(),
                    ..copy_entry(ours)
                }
            }
            (Some(side), None) | (None, Some(side)) => copy_entry(side),
            (None, None) => match &conflict.ancestor {
                Some(ancestor) => {
                    index.conflict_remove(entry_path(ancestor))?;
                    continue;
                }
                None => continue,
            },
        };
        index.conflict_remove(entry_path(&resolved))?;
        index.add(&IndexEntry { flags: resolved.flags & !STAGE_MASK, ..resolved })?;
    }
    Ok(())
}

fn copy_entry(entry: &IndexEntry) -> IndexEntry {
    IndexEntry {
        ctime: entry.ctime,
        mtime: entry.mtime,
        dev: entry.dev,
        ino: entry.ino,
        mode: entry.mode,
        uid: entry.uid,
        gid: entry.gid,
        file_size: entry.file_size,
        id: entry.id,
        flags: entry.flags,
        flags_extended: entry.flags_extended,
        path: entry.path.clone(),
    }
}

fn entry_path(entry: &IndexEntry) -> &Path {
    Path::new(std::str::from_utf8(&entry.path).unwrap_or_default())
}
