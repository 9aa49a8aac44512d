//! Content-diff storage: the per-changeset anchor row, per-file differences
//! and their ordered blocks of changed lines.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::changesets::changed_file_from_row;
use crate::highlight;
use crate::types::{
    ChangedFile, ChangedLineBlock, ContentDifference, FileDifference, FileSide, HighlightKey,
};

/// Creates the content-diff anchor for `changeset`, or bumps its `requested`
/// timestamp. Returns the row and whether it was newly created.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the changeset does not exist or a statement
/// fails.
pub fn request(
    db: &Connection,
    changeset: i64,
    now: i64,
) -> rusqlite::Result<(ContentDifference, bool)> {
    let created = db.execute(
        "INSERT INTO changesetcontentdifferences (changeset, requested) VALUES (?1, ?2)
         ON CONFLICT(changeset) DO NOTHING",
        params![changeset, now],
    )? > 0;
    if !created {
        db.execute(
            "UPDATE changesetcontentdifferences
                SET requested = MAX(requested, ?2)
              WHERE changeset = ?1",
            params![changeset, now],
        )?;
    }
    let row = fetch(db, changeset)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
    Ok((row, created))
}

/// Loads the content-diff anchor of `changeset` without touching it.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the query fails.
pub fn fetch(db: &Connection, changeset: i64) -> rusqlite::Result<Option<ContentDifference>> {
    db.query_row(
        "SELECT changeset, requested, complete
           FROM changesetcontentdifferences
          WHERE changeset = ?1",
        params![changeset],
        |r| Ok(ContentDifference { changeset: r.get(0)?, requested: r.get(1)?, complete: r.get(2)? }),
    )
    .optional()
}

/// Flags the content diff complete. A missing anchor is left missing.
pub fn set_complete(db: &Connection, changeset: i64) -> rusqlite::Result<()> {
    db.execute(
        "UPDATE changesetcontentdifferences SET complete = 1 WHERE changeset = ?1",
        params![changeset],
    )?;
    Ok(())
}

/// Structure-diff entries that have no file difference yet.
pub fn unexamined_files(db: &Connection, changeset: i64) -> rusqlite::Result<Vec<ChangedFile>> {
    let mut stmt = db.prepare(
        "SELECT csf.file, files.path, csf.old_sha1, csf.old_mode, csf.new_sha1, csf.new_mode
           FROM changesetfiles AS csf
           JOIN files ON (files.id = csf.file)
      LEFT JOIN changesetfiledifferences AS csfd
             ON (csfd.changeset = csf.changeset AND csfd.file = csf.file)
          WHERE csf.changeset = ?1
            AND csfd.changeset IS NULL
          ORDER BY csf.file",
    )?;
    let rows = stmt
        .query_map(params![changeset], changed_file_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Files whose line-level comparison is still outstanding.
pub fn pending_comparisons(db: &Connection, changeset: i64) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = db.prepare(
        "SELECT file FROM changesetfiledifferences
          WHERE changeset = ?1 AND comparison_pending
          ORDER BY file",
    )?;
    let rows = stmt.query_map(params![changeset], |r| r.get(0))?.collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(rows)
}

/// `(file, index)` of every block whose analysis is still NULL.
pub fn unanalyzed_blocks(db: &Connection, changeset: i64) -> rusqlite::Result<Vec<(i64, i64)>> {
    let mut stmt = db.prepare(
        "SELECT file, \"index\" FROM changesetchangedlines
          WHERE changeset = ?1 AND analysis IS NULL
          ORDER BY file, \"index\"",
    )?;
    let rows = stmt
        .query_map(params![changeset], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Requested highlight entries referenced by this changeset's file
/// differences, as `(id, sha1)`.
pub fn requested_highlights(db: &Connection, changeset: i64) -> rusqlite::Result<Vec<(i64, String)>> {
    let mut stmt = db.prepare(
        "SELECT DISTINCT hlf.id, hlf.sha1
           FROM highlightfiles AS hlf
           JOIN changesetfiledifferences AS csfd ON (
                  csfd.old_highlightfile = hlf.id OR csfd.new_highlightfile = hlf.id
                )
          WHERE csfd.changeset = ?1 AND hlf.requested
          ORDER BY hlf.id",
    )?;
    let rows = stmt
        .query_map(params![changeset], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Inserts an examined file difference together with any blocks that are
/// known without a line comparison (whole-file adds and removes).
///
/// `highlights` names the highlight entries to request for the old and new
/// side. They are created (or re-requested) in the same transaction and
/// their ids replace the sides' `highlight_file`, so a file difference never
/// points at an entry that garbage collection could have missed.
///
/// Returns `false` if another writer inserted the row first; its blocks are
/// then left as that writer stored them. Also returns `false`, writing
/// nothing, when the content-difference anchor has been collected since the
/// job was planned.
///
/// # Errors
///
/// Returns `rusqlite::Error` on SQL failure, including `SQLITE_BUSY` when
/// the IMMEDIATE transaction cannot start.
pub fn insert_file_difference(
    db: &mut Connection,
    repository: i64,
    difference: &FileDifference,
    highlights: [Option<&HighlightKey>; 2],
    blocks: &[ChangedLineBlock],
) -> rusqlite::Result<bool> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    if !anchor_exists(&tx, difference.changeset)? {
        return Ok(false);
    }
    let mut sides = [difference.old, difference.new];
    for (side, key) in sides.iter_mut().zip(highlights) {
        if let (Some(side), Some(key)) = (side.as_mut(), key) {
            let entry = highlight::ensure(
                &tx,
                repository,
                &key.sha1,
                key.language.as_deref(),
                key.conflicts,
            )?;
            side.highlight_file = Some(entry.id);
        }
    }
    let [old, new] = sides;
    let (old, new) = (old.as_ref(), new.as_ref());
    let inserted = tx.execute(
        "INSERT INTO changesetfiledifferences
                (changeset, file, comparison_pending,
                 old_is_binary, old_length, old_linebreak, old_highlightfile,
                 new_is_binary, new_length, new_linebreak, new_highlightfile)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(changeset, file) DO NOTHING",
        params![
            difference.changeset,
            difference.file,
            difference.comparison_pending,
            old.map(|s| s.is_binary),
            old.map(|s| s.length),
            old.map(|s| s.linebreak),
            old.and_then(|s| s.highlight_file),
            new.map(|s| s.is_binary),
            new.map(|s| s.length),
            new.map(|s| s.linebreak),
            new.and_then(|s| s.highlight_file),
        ],
    )? > 0;
    if inserted {
        insert_blocks(&tx, difference.changeset, difference.file, blocks)?;
    }
    tx.commit()?;
    Ok(inserted)
}

/// Stores the result of a line comparison.
///
/// Clearing `comparison_pending` and inserting the blocks happen in one
/// transaction, guarded on the flag still being set: a second writer racing
/// on the same file inserts nothing and gets `false`. The same holds once
/// the anchor is collected, since its file differences cascade with it.
///
/// # Errors
///
/// Returns `rusqlite::Error` on SQL failure.
pub fn store_comparison(
    db: &mut Connection,
    changeset: i64,
    file: i64,
    blocks: &[ChangedLineBlock],
) -> rusqlite::Result<bool> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let claimed = tx.execute(
        "UPDATE changesetfiledifferences
            SET comparison_pending = 0
          WHERE changeset = ?1 AND file = ?2 AND comparison_pending",
        params![changeset, file],
    )? > 0;
    if claimed {
        insert_blocks(&tx, changeset, file, blocks)?;
    }
    tx.commit()?;
    Ok(claimed)
}

fn anchor_exists(db: &Connection, changeset: i64) -> rusqlite::Result<bool> {
    db.query_row(
        "SELECT 1 FROM changesetcontentdifferences WHERE changeset = ?1",
        params![changeset],
        |_| Ok(()),
    )
    .optional()
    .map(|row| row.is_some())
}

fn insert_blocks(
    db: &Connection,
    changeset: i64,
    file: i64,
    blocks: &[ChangedLineBlock],
) -> rusqlite::Result<()> {
    let mut stmt = db.prepare(
        "INSERT INTO changesetchangedlines
                (changeset, file, \"index\", \"offset\", delete_count, delete_length,
                 insert_count, insert_length, analysis)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    for b in blocks {
        stmt.execute(params![
            changeset,
            file,
            b.index,
            b.offset,
            b.delete_count,
            b.delete_length,
            b.insert_count,
            b.insert_length,
            b.analysis,
        ])?;
    }
    Ok(())
}

const FILE_DIFFERENCE_COLUMNS: &str = "
    SELECT csfd.changeset, csfd.file, files.path, csfd.comparison_pending,
           csfd.old_is_binary, csfd.old_length, csfd.old_linebreak, csfd.old_highlightfile,
           csfd.new_is_binary, csfd.new_length, csfd.new_linebreak, csfd.new_highlightfile
      FROM changesetfiledifferences AS csfd
      JOIN files ON (files.id = csfd.file)";

fn side_from_row(r: &rusqlite::Row<'_>, base: usize) -> rusqlite::Result<Option<FileSide>> {
    let is_binary: Option<bool> = r.get(base)?;
    Ok(match is_binary {
        Some(is_binary) => Some(FileSide {
            is_binary,
            length: r.get::<_, Option<i64>>(base + 1)?.unwrap_or(0),
            linebreak: r.get::<_, Option<bool>>(base + 2)?.unwrap_or(false),
            highlight_file: r.get(base + 3)?,
        }),
        None => None,
    })
}

fn file_difference_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<FileDifference> {
    Ok(FileDifference {
        changeset: r.get(0)?,
        file: r.get(1)?,
        path: r.get(2)?,
        comparison_pending: r.get(3)?,
        old: side_from_row(r, 4)?,
        new: side_from_row(r, 8)?,
    })
}

/// Every examined file of `changeset`, ordered by path.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the query fails.
pub fn file_differences(db: &Connection, changeset: i64) -> rusqlite::Result<Vec<FileDifference>> {
    let mut stmt =
        db.prepare(&format!("{FILE_DIFFERENCE_COLUMNS} WHERE csfd.changeset = ?1 ORDER BY files.path"))?;
    let rows = stmt
        .query_map(params![changeset], file_difference_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// The file difference of one file, if it has been examined.
pub fn file_difference(
    db: &Connection,
    changeset: i64,
    file: i64,
) -> rusqlite::Result<Option<FileDifference>> {
    db.query_row(
        &format!("{FILE_DIFFERENCE_COLUMNS} WHERE csfd.changeset = ?1 AND csfd.file = ?2"),
        params![changeset, file],
        file_difference_from_row,
    )
    .optional()
}

fn block_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<ChangedLineBlock> {
    Ok(ChangedLineBlock {
        index: r.get(0)?,
        offset: r.get(1)?,
        delete_count: r.get(2)?,
        delete_length: r.get(3)?,
        insert_count: r.get(4)?,
        insert_length: r.get(5)?,
        analysis: r.get(6)?,
    })
}

/// Blocks of one file, ordered by index.
pub fn changed_lines(
    db: &Connection,
    changeset: i64,
    file: i64,
) -> rusqlite::Result<Vec<ChangedLineBlock>> {
    let mut stmt = db.prepare(
        "SELECT \"index\", \"offset\", delete_count, delete_length,
                insert_count, insert_length, analysis
           FROM changesetchangedlines
          WHERE changeset = ?1 AND file = ?2
          ORDER BY \"index\"",
    )?;
    let rows = stmt
        .query_map(params![changeset, file], block_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Writes the analysis of one block. Last writer wins; the content is a pure
/// function of the two line spans.
pub fn set_analysis(
    db: &Connection,
    changeset: i64,
    file: i64,
    index: i64,
    analysis: &str,
) -> rusqlite::Result<bool> {
    let n = db.execute(
        "UPDATE changesetchangedlines SET analysis = ?4
          WHERE changeset = ?1 AND file = ?2 AND \"index\" = ?3",
        params![changeset, file, index, analysis],
    )?;
    Ok(n > 0)
}
