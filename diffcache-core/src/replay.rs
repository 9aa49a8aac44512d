//! Merge (and rebase) replay requests.
//!
//! A request is keyed on `(repository, merge)`. It starts pending and ends
//! in exactly one of two terminal states: a replay commit or a failure
//! trace. The table CHECK keeps the two columns exclusive.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Result, StoreError};
use crate::repositories::ensure_commit;
use crate::types::{MergeReplayRequest, ReplayState};

fn request_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<MergeReplayRequest> {
    let replay: Option<String> = r.get(3)?;
    let traceback: Option<String> = r.get(4)?;
    let state = match (replay, traceback) {
        (Some(sha1), _) => ReplayState::Replayed(sha1),
        (None, Some(trace)) => ReplayState::Failed(trace),
        (None, None) => ReplayState::Pending,
    };
    Ok(MergeReplayRequest { repository: r.get(0)?, merge: r.get(1)?, onto: r.get(2)?, state })
}

const REQUEST_COLUMNS: &str = "
    SELECT mrr.repository, mc.sha1, oc.sha1, rc.sha1, mrr.traceback
      FROM mergereplayrequests AS mrr
      JOIN commits AS mc ON (mc.id = mrr.merge)
 LEFT JOIN commits AS oc ON (oc.id = mrr.onto)
 LEFT JOIN commits AS rc ON (rc.id = mrr.replay)";

/// Registers a replay of `merge`, or of a rebased commit when `onto` is set.
///
/// Existing requests are returned as they are, except that `retry` resets a
/// failed request to pending. A failed request retried with a different
/// `onto` takes the new base.
///
/// # Errors
///
/// Returns [`StoreError::InvalidInput`] when a request for `merge` already
/// exists with a different `onto` and is not a failure being retried, or
/// [`StoreError::Sql`] on SQL failure.
pub fn request(
    db: &mut Connection,
    repository: i64,
    merge: &str,
    onto: Option<&str>,
    retry: bool,
) -> Result<MergeReplayRequest> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let merge_id = ensure_commit(&tx, repository, merge)?;
    let onto_id = onto.map(|sha1| ensure_commit(&tx, repository, sha1)).transpose()?;
    let created = tx.execute(
        "INSERT INTO mergereplayrequests (repository, merge, onto) VALUES (?1, ?2, ?3)
         ON CONFLICT(repository, merge) DO NOTHING",
        params![repository, merge_id, onto_id],
    )? > 0;
    let select = format!("{REQUEST_COLUMNS} WHERE mrr.repository = ?1 AND mrr.merge = ?2");
    let existing = tx.query_row(&select, params![repository, merge_id], request_from_row)?;

    if !created && existing.onto.as_deref() != onto {
        let failed = matches!(existing.state, ReplayState::Failed(_));
        if !(retry && failed) {
            return Err(StoreError::InvalidInput(format!(
                "{merge} already has a replay request onto {}",
                existing.onto.as_deref().unwrap_or("its parents")
            )));
        }
        tx.execute(
            "UPDATE mergereplayrequests SET onto = ?3, traceback = NULL
              WHERE repository = ?1 AND merge = ?2",
            params![repository, merge_id, onto_id],
        )?;
    } else if retry {
        tx.execute(
            "UPDATE mergereplayrequests SET traceback = NULL
              WHERE repository = ?1 AND merge = ?2 AND traceback IS NOT NULL",
            params![repository, merge_id],
        )?;
    }
    let request = tx.query_row(&select, params![repository, merge_id], request_from_row)?;
    tx.commit()?;
    Ok(request)
}

/// Loads the request for `merge`, in whatever state it is.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the query fails.
pub fn fetch(db: &Connection, repository: i64, merge: &str) -> rusqlite::Result<Option<MergeReplayRequest>> {
    db.query_row(
        &format!("{REQUEST_COLUMNS} WHERE mrr.repository = ?1 AND mc.sha1 = ?2"),
        params![repository, merge],
        request_from_row,
    )
    .optional()
}

/// Requests with neither a replay nor a failure recorded yet.
pub fn pending(db: &Connection) -> rusqlite::Result<Vec<MergeReplayRequest>> {
    let mut stmt = db.prepare(&format!(
        "{REQUEST_COLUMNS} WHERE mrr.replay IS NULL AND mrr.traceback IS NULL
          ORDER BY mrr.repository, mc.sha1"
    ))?;
    let rows = stmt.query_map([], request_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Records the replay commit. Only a pending request transitions; returns
/// `false` if another worker already finished it.
pub fn store_success(
    db: &mut Connection,
    repository: i64,
    merge: &str,
    replay: &str,
) -> rusqlite::Result<bool> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let replay_id = ensure_commit(&tx, repository, replay)?;
    let n = tx.execute(
        "UPDATE mergereplayrequests SET replay = ?3
          WHERE repository = ?1
            AND merge = (SELECT id FROM commits WHERE repository = ?1 AND sha1 = ?2)
            AND replay IS NULL AND traceback IS NULL",
        params![repository, merge, replay_id],
    )?;
    tx.commit()?;
    Ok(n > 0)
}

/// Records why a replay could not be made. Like [`store_success`], only a
/// pending request transitions.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the update fails.
pub fn store_failure(
    db: &Connection,
    repository: i64,
    merge: &str,
    traceback: &str,
) -> rusqlite::Result<bool> {
    let n = db.execute(
        "UPDATE mergereplayrequests SET traceback = ?3
          WHERE repository = ?1
            AND merge = (SELECT id FROM commits WHERE repository = ?1 AND sha1 = ?2)
            AND replay IS NULL AND traceback IS NULL",
        params![repository, merge, traceback],
    )?;
    Ok(n > 0)
}
