//! Shared highlight cache: one entry per `(repository, sha1, language,
//! conflicts)`, its tokenized lines, ad-hoc request handles and the code
//! contexts recorded alongside.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Result, StoreError};
use crate::types::{
    ChangesetHighlightRequest, CodeContext, CustomHighlightRequest, HighlightFile, HighlightState, Token,
};

const HIGHLIGHT_COLUMNS: &str =
    "SELECT id, repository, sha1, language, conflicts, requested, highlighted FROM highlightfiles";

fn highlight_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<HighlightFile> {
    Ok(HighlightFile {
        id: r.get(0)?,
        repository: r.get(1)?,
        sha1: r.get(2)?,
        language: r.get(3)?,
        conflicts: r.get(4)?,
        state: HighlightState::from_flags(r.get(5)?, r.get(6)?),
    })
}

/// Returns the cache entry for the four-tuple, creating it as requested.
///
/// An existing entry in neither state is flipped back to requested: that is
/// how a previously idle entry is asked for again. Entries already requested
/// or highlighted are returned unchanged.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the transaction cannot start or a statement
/// fails.
pub fn request(
    db: &mut Connection,
    repository: i64,
    sha1: &str,
    language: Option<&str>,
    conflicts: bool,
) -> rusqlite::Result<HighlightFile> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let entry = ensure(&tx, repository, sha1, language, conflicts)?;
    tx.commit()?;
    Ok(entry)
}

/// Body of [`request`], for callers that already hold a transaction.
pub(crate) fn ensure(
    tx: &Connection,
    repository: i64,
    sha1: &str,
    language: Option<&str>,
    conflicts: bool,
) -> rusqlite::Result<HighlightFile> {
    tx.execute(
        "INSERT INTO highlightfiles (repository, sha1, language, conflicts)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT DO NOTHING",
        params![repository, sha1, language, conflicts],
    )?;
    tx.execute(
        "UPDATE highlightfiles SET requested = 1
          WHERE repository = ?1 AND sha1 = ?2 AND language IS ?3 AND conflicts = ?4
            AND NOT requested AND NOT highlighted",
        params![repository, sha1, language, conflicts],
    )?;
    tx.query_row(
        &format!(
            "{HIGHLIGHT_COLUMNS}
              WHERE repository = ?1 AND sha1 = ?2 AND language IS ?3 AND conflicts = ?4"
        ),
        params![repository, sha1, language, conflicts],
        highlight_from_row,
    )
}

/// Loads entry `id`.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the query fails.
pub fn fetch(db: &Connection, id: i64) -> rusqlite::Result<Option<HighlightFile>> {
    db.query_row(&format!("{HIGHLIGHT_COLUMNS} WHERE id = ?1"), params![id], highlight_from_row)
        .optional()
}

/// Looks up the entry for a four-tuple without requesting it.
pub fn find(
    db: &Connection,
    repository: i64,
    sha1: &str,
    language: Option<&str>,
    conflicts: bool,
) -> rusqlite::Result<Option<HighlightFile>> {
    db.query_row(
        &format!(
            "{HIGHLIGHT_COLUMNS}
              WHERE repository = ?1 AND sha1 = ?2 AND language IS ?3 AND conflicts = ?4"
        ),
        params![repository, sha1, language, conflicts],
        highlight_from_row,
    )
    .optional()
}

/// Every entry currently waiting for the highlighter.
pub fn pending(db: &Connection) -> rusqlite::Result<Vec<HighlightFile>> {
    let mut stmt = db.prepare(&format!("{HIGHLIGHT_COLUMNS} WHERE requested ORDER BY id"))?;
    let rows = stmt.query_map([], highlight_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Requested entries kept alive by an ad-hoc request. Entries referenced by
/// file differences are planned through their changeset instead.
pub fn pending_custom(db: &Connection) -> rusqlite::Result<Vec<i64>> {
    let mut stmt = db.prepare(
        "SELECT DISTINCT hlf.id
           FROM highlightfiles AS hlf
           JOIN customhighlightrequests AS chr ON (chr.file = hlf.id)
          WHERE hlf.requested
          ORDER BY hlf.id",
    )?;
    let ids = stmt.query_map([], |r| r.get(0))?.collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

/// Stores the highlighted lines of entry `id`.
///
/// `lines` holds one encoded token payload per source line. The lines and
/// the code contexts, keyed by the detected `language`, are written in the
/// transaction that flips the entry to highlighted. The flip
/// is guarded on `requested` still being set, so a losing racer writes
/// nothing and gets `false`.
///
/// # Errors
///
/// Returns `rusqlite::Error` on SQL failure; nothing is written then.
pub fn store_lines(
    db: &mut Connection,
    id: i64,
    language: &str,
    lines: &[String],
    contexts: &[CodeContext],
) -> rusqlite::Result<bool> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let claimed = tx.execute(
        "UPDATE highlightfiles SET requested = 0, highlighted = 1
          WHERE id = ?1 AND requested",
        params![id],
    )? > 0;
    if !claimed {
        return Ok(false);
    }
    let sha1: String = tx.query_row("SELECT sha1 FROM highlightfiles WHERE id = ?1", params![id], |r| r.get(0))?;
    {
        let mut insert = tx.prepare("INSERT INTO highlightlines (file, line, data) VALUES (?1, ?2, ?3)")?;
        for (line, data) in lines.iter().enumerate() {
            insert.execute(params![id, line as i64, data])?;
        }
        let mut context = tx.prepare(
            "INSERT INTO codecontexts (sha1, language, first_line, last_line, context)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT DO NOTHING",
        )?;
        for c in contexts {
            context.execute(params![sha1, language, c.first_line, c.last_line, c.context])?;
        }
    }
    tx.commit()?;
    Ok(true)
}

/// Marks entry `id` as neither requested nor highlighted. Used when no
/// language can be detected; the entry stays idle until asked for again.
pub fn drop_request(db: &Connection, id: i64) -> rusqlite::Result<()> {
    db.execute("UPDATE highlightfiles SET requested = 0 WHERE id = ?1", params![id])?;
    Ok(())
}

/// Returns the decoded tokens of every line, in order.
pub fn lines(db: &Connection, id: i64) -> Result<Vec<Vec<Token>>> {
    let mut stmt = db.prepare("SELECT data FROM highlightlines WHERE file = ?1 ORDER BY line")?;
    let raw = stmt
        .query_map(params![id], |r| r.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    let mut decoded = Vec::with_capacity(raw.len());
    for data in raw {
        decoded.push(serde_json::from_str::<Vec<Token>>(&data)?);
    }
    Ok(decoded)
}

/// Encodes one line's tokens into the stored payload form.
pub fn encode_line(tokens: &[Token]) -> Result<String> {
    Ok(serde_json::to_string(tokens)?)
}

/// Creates an ad-hoc request handle that keeps entry `file` alive.
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] if entry `file` does not exist.
pub fn create_custom(db: &Connection, file: i64, now: i64) -> Result<CustomHighlightRequest> {
    if fetch(db, file)?.is_none() {
        return Err(StoreError::NotFound(format!("highlight file {file}")));
    }
    let id = uuid::Uuid::new_v4().to_string();
    db.execute(
        "INSERT INTO customhighlightrequests (id, file, last_access) VALUES (?1, ?2, ?3)",
        params![id, file, now],
    )?;
    Ok(CustomHighlightRequest { id, file, last_access: now })
}

/// Bumps `last_access` of an ad-hoc request. Returns `None` once it has been
/// collected.
pub fn touch_custom(db: &Connection, id: &str, now: i64) -> rusqlite::Result<Option<CustomHighlightRequest>> {
    db.query_row(
        "UPDATE customhighlightrequests SET last_access = MAX(last_access, ?2)
          WHERE id = ?1
      RETURNING id, file, last_access",
        params![id, now],
        |r| Ok(CustomHighlightRequest { id: r.get(0)?, file: r.get(1)?, last_access: r.get(2)? }),
    )
    .optional()
}

/// Returns the innermost recorded context enclosing `line` (zero-based).
pub fn code_context(
    db: &Connection,
    sha1: &str,
    language: &str,
    line: i64,
) -> rusqlite::Result<Option<CodeContext>> {
    db.query_row(
        "SELECT first_line, last_line, context FROM codecontexts
          WHERE sha1 = ?1 AND language = ?2
            AND first_line <= ?3 AND last_line >= ?3
          ORDER BY first_line DESC, last_line ASC
          LIMIT 1",
        params![sha1, language, line],
        |r| Ok(CodeContext { first_line: r.get(0)?, last_line: r.get(1)?, context: r.get(2)? }),
    )
    .optional()
}

/// Records whether `changeset` wants its file versions highlighted.
///
/// A request is sticky: asking again with `requested = false` leaves an
/// earlier request in place. Turning a request on clears `evaluated` so the
/// runner looks at the changeset again.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the changeset does not exist (foreign key)
/// or the statement fails.
pub fn request_changeset(
    db: &Connection,
    changeset: i64,
    requested: bool,
) -> rusqlite::Result<ChangesetHighlightRequest> {
    db.execute(
        "INSERT INTO changesethighlightrequests (changeset, requested) VALUES (?1, ?2)
         ON CONFLICT(changeset) DO UPDATE
            SET evaluated = CASE WHEN requested THEN evaluated ELSE 0 END,
                requested = requested OR excluded.requested",
        params![changeset, requested],
    )?;
    changeset_request(db, changeset)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

/// The highlight request row of `changeset`, if one was ever recorded.
pub fn changeset_request(
    db: &Connection,
    changeset: i64,
) -> rusqlite::Result<Option<ChangesetHighlightRequest>> {
    db.query_row(
        "SELECT changeset, requested, evaluated
           FROM changesethighlightrequests
          WHERE changeset = ?1",
        params![changeset],
        |r| Ok(ChangesetHighlightRequest { changeset: r.get(0)?, requested: r.get(1)?, evaluated: r.get(2)? }),
    )
    .optional()
}

/// Marks a requested changeset as evaluated. No-op when highlighting was
/// never requested for it.
pub fn set_evaluated(db: &Connection, changeset: i64) -> rusqlite::Result<()> {
    db.execute(
        "UPDATE changesethighlightrequests SET evaluated = 1
          WHERE changeset = ?1 AND requested",
        params![changeset],
    )?;
    Ok(())
}
