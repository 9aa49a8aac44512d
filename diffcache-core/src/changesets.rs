//! Changeset registry: identity and structure-diff storage.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::repositories::{ensure_commit, ensure_file};
use crate::types::{ChangedFile, Changeset};

const CHANGESET_COLUMNS: &str = "
    SELECT cs.id, cs.repository, tc.sha1, fc.sha1, mc.sha1,
           cs.is_replay, cs.processed, cs.complete
      FROM changesets AS cs
      JOIN commits AS tc ON (tc.id = cs.to_commit)
 LEFT JOIN commits AS fc ON (fc.id = cs.from_commit)
 LEFT JOIN commits AS mc ON (mc.id = cs.for_merge)";

fn changeset_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Changeset> {
    Ok(Changeset {
        id: r.get(0)?,
        repository: r.get(1)?,
        to_commit: r.get(2)?,
        from_commit: r.get(3)?,
        for_merge: r.get(4)?,
        is_replay: r.get(5)?,
        processed: r.get(6)?,
        complete: r.get(7)?,
    })
}

/// Returns the changeset for the given commits, creating it if absent.
///
/// The insert and the read-back run in one `BEGIN IMMEDIATE` transaction.
/// When several connections race, the partial unique indexes let exactly one
/// insert land; every caller then reads back that row. `is_replay` only
/// applies to the creating call.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the transaction cannot start (`SQLITE_BUSY`
/// once the busy timeout runs out) or any statement fails.
pub fn get_or_create(
    db: &mut Connection,
    repository: i64,
    to_commit: &str,
    from_commit: Option<&str>,
    for_merge: Option<&str>,
    is_replay: bool,
) -> rusqlite::Result<Changeset> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let to_id = ensure_commit(&tx, repository, to_commit)?;
    let from_id = from_commit.map(|sha1| ensure_commit(&tx, repository, sha1)).transpose()?;
    let merge_id = for_merge.map(|sha1| ensure_commit(&tx, repository, sha1)).transpose()?;

    tx.execute(
        "INSERT INTO changesets (repository, to_commit, from_commit, for_merge, is_replay)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT DO NOTHING",
        params![repository, to_id, from_id, merge_id, is_replay],
    )?;
    let id: i64 = tx.query_row(
        "SELECT id FROM changesets
          WHERE repository = ?1 AND to_commit = ?2
            AND from_commit IS ?3 AND for_merge IS ?4",
        params![repository, to_id, from_id, merge_id],
        |r| r.get(0),
    )?;
    let changeset = tx.query_row(
        &format!("{CHANGESET_COLUMNS} WHERE cs.id = ?1"),
        params![id],
        changeset_from_row,
    )?;
    tx.commit()?;
    Ok(changeset)
}

/// Loads changeset `id`, or `None` if it does not exist (or was cascaded
/// away with its repository or commits).
///
/// # Errors
///
/// Returns `rusqlite::Error` if the query fails.
pub fn fetch(db: &Connection, id: i64) -> rusqlite::Result<Option<Changeset>> {
    db.query_row(&format!("{CHANGESET_COLUMNS} WHERE cs.id = ?1"), params![id], changeset_from_row)
        .optional()
}

/// Looks up a changeset without creating it.
pub fn find(
    db: &Connection,
    repository: i64,
    to_commit: &str,
    from_commit: Option<&str>,
    for_merge: Option<&str>,
) -> rusqlite::Result<Option<Changeset>> {
    db.query_row(
        &format!(
            "{CHANGESET_COLUMNS}
              WHERE cs.repository = ?1 AND tc.sha1 = ?2
                AND fc.sha1 IS ?3 AND mc.sha1 IS ?4"
        ),
        params![repository, to_commit, from_commit, for_merge],
        changeset_from_row,
    )
    .optional()
}

/// Marks the structure difference of `id` as started. The flag never goes
/// back to false.
pub fn set_processed(db: &Connection, id: i64) -> rusqlite::Result<()> {
    db.execute("UPDATE changesets SET processed = 1 WHERE id = ?1", params![id])?;
    Ok(())
}

/// Marks the structure difference of `id` as complete, which implies
/// processed.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the update fails.
pub fn set_complete(db: &Connection, id: i64) -> rusqlite::Result<()> {
    db.execute(
        "UPDATE changesets SET processed = 1, complete = 1 WHERE id = ?1",
        params![id],
    )?;
    Ok(())
}

/// A structure-diff entry as produced by the tree comparison, before the
/// path has been interned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChangedFile {
    pub path: String,
    pub old_sha1: Option<String>,
    pub old_mode: Option<i64>,
    pub new_sha1: Option<String>,
    pub new_mode: Option<i64>,
}

/// Inserts one batch of structure-diff rows in a single transaction.
///
/// Rows already present are left untouched, so a batch interrupted half-way
/// can be replayed.
pub fn insert_files(
    db: &mut Connection,
    changeset: i64,
    files: &[NewChangedFile],
) -> rusqlite::Result<()> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for f in files {
        let file = ensure_file(&tx, &f.path)?;
        tx.execute(
            "INSERT INTO changesetfiles
                    (changeset, file, old_sha1, old_mode, new_sha1, new_mode)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(changeset, file) DO NOTHING",
            params![changeset, file, f.old_sha1, f.old_mode, f.new_sha1, f.new_mode],
        )?;
    }
    tx.commit()
}

/// Returns the structure diff, ordered by path. May be partial while the
/// changeset is not `complete`.
pub fn structure_diff(db: &Connection, changeset: i64) -> rusqlite::Result<Vec<ChangedFile>> {
    let mut stmt = db.prepare(
        "SELECT csf.file, files.path, csf.old_sha1, csf.old_mode, csf.new_sha1, csf.new_mode
           FROM changesetfiles AS csf
           JOIN files ON (files.id = csf.file)
          WHERE csf.changeset = ?1
          ORDER BY files.path",
    )?;
    let rows = stmt
        .query_map(params![changeset], changed_file_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// One structure-diff entry of `changeset`.
pub fn changed_file(
    db: &Connection,
    changeset: i64,
    file: i64,
) -> rusqlite::Result<Option<ChangedFile>> {
    db.query_row(
        "SELECT csf.file, files.path, csf.old_sha1, csf.old_mode, csf.new_sha1, csf.new_mode
           FROM changesetfiles AS csf
           JOIN files ON (files.id = csf.file)
          WHERE csf.changeset = ?1 AND csf.file = ?2",
        params![changeset, file],
        changed_file_from_row,
    )
    .optional()
}

pub(crate) fn changed_file_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ChangedFile> {
    Ok(ChangedFile {
        file: r.get(0)?,
        path: r.get(1)?,
        old_sha1: r.get(2)?,
        old_mode: r.get(3)?,
        new_sha1: r.get(4)?,
        new_mode: r.get(5)?,
    })
}

/// Removes from each of the two changesets every file the other does not
/// also touch, then marks both complete. Used for merge-scoped changesets,
/// where only files changed on both sides can carry overlapping edits.
pub fn prune_to_common_and_complete(
    db: &mut Connection,
    primary: i64,
    reference: i64,
) -> rusqlite::Result<()> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    for (prune, other) in [(primary, reference), (reference, primary)] {
        tx.execute(
            "DELETE FROM changesetfiles
              WHERE changeset = ?1
                AND file NOT IN (SELECT file FROM changesetfiles WHERE changeset = ?2)",
            params![prune, other],
        )?;
    }
    tx.execute(
        "UPDATE changesets SET processed = 1, complete = 1 WHERE id IN (?1, ?2)",
        params![primary, reference],
    )?;
    tx.commit()
}

/// Changesets with outstanding work, for the runner to pick up on startup.
///
/// Covers incomplete structure diffs (skipping merge reference changesets,
/// which are computed by their primary), incomplete content diffs, and
/// changesets with highlighting requested that is either not evaluated yet
/// or still references requested highlight entries.
pub fn find_incomplete(db: &Connection) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = db.prepare(
        "SELECT cs.id FROM changesets AS cs
          WHERE NOT cs.complete
            AND (cs.for_merge IS NULL OR cs.for_merge = cs.to_commit)
         UNION
         SELECT cscd.changeset FROM changesetcontentdifferences AS cscd
          WHERE NOT cscd.complete
         UNION
         SELECT cshlr.changeset FROM changesethighlightrequests AS cshlr
           JOIN changesets AS cs ON (cs.id = cshlr.changeset)
           JOIN changesetcontentdifferences AS cscd ON (cscd.changeset = cshlr.changeset)
          WHERE cs.complete AND cshlr.requested AND NOT cshlr.evaluated
         UNION
         SELECT DISTINCT csfd.changeset
           FROM changesetfiledifferences AS csfd
           JOIN changesethighlightrequests AS cshlr ON (cshlr.changeset = csfd.changeset)
           JOIN highlightfiles AS hlf ON (
                  hlf.id = csfd.old_highlightfile OR hlf.id = csfd.new_highlightfile
                )
          WHERE cshlr.requested AND hlf.requested
         ORDER BY 1",
    )?;
    let ids = stmt.query_map([], |r| r.get(0))?.collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}
