//! Per-job failure journal.
//!
//! A row in `changeseterrors` suppresses its job: the runner never plans a
//! journaled key again until an operator clears it.

use rusqlite::{params, Connection};

use crate::job::{JobErrorRecord, JobKey};

/// Records a failure, replacing any previous record for the same key.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the upsert fails.
pub fn record(
    db: &Connection,
    changeset: i64,
    key: &JobKey,
    fatal: bool,
    traceback: &str,
) -> rusqlite::Result<()> {
    let (kind, file, block, sha1) = key.to_columns();
    db.execute(
        "INSERT INTO changeseterrors (changeset, job_kind, file, block, sha1, fatal, traceback)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(changeset, job_kind, file, block, sha1)
         DO UPDATE SET fatal = excluded.fatal, traceback = excluded.traceback",
        params![changeset, kind, file, block, sha1, fatal, traceback],
    )?;
    Ok(())
}

/// True when `key` has a journaled failure for `changeset`; such jobs are
/// not run again until the record is cleared.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the query fails.
pub fn is_suppressed(db: &Connection, changeset: i64, key: &JobKey) -> rusqlite::Result<bool> {
    let (kind, file, block, sha1) = key.to_columns();
    db.query_row(
        "SELECT EXISTS (
             SELECT 1 FROM changeseterrors
              WHERE changeset = ?1 AND job_kind = ?2 AND file = ?3 AND block = ?4 AND sha1 = ?5
         )",
        params![changeset, kind, file, block, sha1],
        |r| r.get(0),
    )
}

/// All journaled failures of a changeset, ordered by key.
pub fn errors(db: &Connection, changeset: i64) -> rusqlite::Result<Vec<JobErrorRecord>> {
    let mut stmt = db.prepare(
        "SELECT job_kind, file, block, sha1, fatal, traceback
           FROM changeseterrors
          WHERE changeset = ?1",
    )?;
    let rows = stmt.query_map(params![changeset], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, i64>(1)?,
            r.get::<_, i64>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, bool>(4)?,
            r.get::<_, String>(5)?,
        ))
    })?;
    let mut records = Vec::new();
    for row in rows {
        let (kind, file, block, sha1, fatal, traceback) = row?;
        if let Some(key) = JobKey::from_columns(&kind, file, block, sha1) {
            records.push(JobErrorRecord { key, fatal, traceback });
        } else {
            tracing::warn!(changeset, job_kind = %kind, "ignoring journal row with unknown job kind");
        }
    }
    records.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(records)
}

/// Keys of every journaled failure, for filtering a job plan.
pub fn failed_keys(db: &Connection, changeset: i64) -> rusqlite::Result<Vec<JobKey>> {
    Ok(errors(db, changeset)?.into_iter().map(|record| record.key).collect())
}

/// Whether any journaled failure of `changeset` left its diff unusable.
pub fn has_fatal(db: &Connection, changeset: i64) -> rusqlite::Result<bool> {
    db.query_row(
        "SELECT EXISTS (SELECT 1 FROM changeseterrors WHERE changeset = ?1 AND fatal)",
        params![changeset],
        |r| r.get(0),
    )
}

/// Clears one journaled failure, or all of them when `key` is `None`.
/// Returns the number of rows removed.
pub fn clear(db: &Connection, changeset: i64, key: Option<&JobKey>) -> rusqlite::Result<usize> {
    match key {
        Some(key) => {
            let (kind, file, block, sha1) = key.to_columns();
            db.execute(
                "DELETE FROM changeseterrors
                  WHERE changeset = ?1 AND job_kind = ?2 AND file = ?3 AND block = ?4 AND sha1 = ?5",
                params![changeset, kind, file, block, sha1],
            )
        }
        None => db.execute("DELETE FROM changeseterrors WHERE changeset = ?1", params![changeset]),
    }
}
