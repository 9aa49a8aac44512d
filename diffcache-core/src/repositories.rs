//! Identity rows: repositories, commits and interned file paths.

use rusqlite::{params, Connection, OptionalExtension};

use crate::types::Repository;

/// Registers `name` at `path`, or updates the path of an existing entry.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the upsert fails.
pub fn register(db: &Connection, name: &str, path: &str) -> rusqlite::Result<Repository> {
    db.execute(
        "INSERT INTO repositories (name, path) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET path = excluded.path",
        params![name, path],
    )?;
    db.query_row(
        "SELECT id, name, path FROM repositories WHERE name = ?1",
        params![name],
        |r| Ok(Repository { id: r.get(0)?, name: r.get(1)?, path: r.get(2)? }),
    )
}

/// Looks up a repository by its registered name.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the query fails.
pub fn find(db: &Connection, name: &str) -> rusqlite::Result<Option<Repository>> {
    db.query_row(
        "SELECT id, name, path FROM repositories WHERE name = ?1",
        params![name],
        |r| Ok(Repository { id: r.get(0)?, name: r.get(1)?, path: r.get(2)? }),
    )
    .optional()
}

/// Looks up a repository by row id.
pub fn by_id(db: &Connection, id: i64) -> rusqlite::Result<Option<Repository>> {
    db.query_row(
        "SELECT id, name, path FROM repositories WHERE id = ?1",
        params![id],
        |r| Ok(Repository { id: r.get(0)?, name: r.get(1)?, path: r.get(2)? }),
    )
    .optional()
}

/// Deletes a repository and, by cascade, everything recorded for it.
///
/// Returns `false` if no repository had that name.
pub fn delete(db: &Connection, name: &str) -> rusqlite::Result<bool> {
    let n = db.execute("DELETE FROM repositories WHERE name = ?1", params![name])?;
    Ok(n > 0)
}

/// Returns the row id for `sha1` in `repository`, inserting it if needed.
pub fn ensure_commit(db: &Connection, repository: i64, sha1: &str) -> rusqlite::Result<i64> {
    db.execute(
        "INSERT INTO commits (repository, sha1) VALUES (?1, ?2)
         ON CONFLICT(repository, sha1) DO NOTHING",
        params![repository, sha1],
    )?;
    db.query_row(
        "SELECT id FROM commits WHERE repository = ?1 AND sha1 = ?2",
        params![repository, sha1],
        |r| r.get(0),
    )
}

/// Deletes a commit; changesets that start or end at it cascade away.
pub fn delete_commit(db: &Connection, repository: i64, sha1: &str) -> rusqlite::Result<bool> {
    let n = db.execute(
        "DELETE FROM commits WHERE repository = ?1 AND sha1 = ?2",
        params![repository, sha1],
    )?;
    Ok(n > 0)
}

/// Returns the interned id for `path`.
pub fn ensure_file(db: &Connection, path: &str) -> rusqlite::Result<i64> {
    db.execute(
        "INSERT INTO files (path) VALUES (?1) ON CONFLICT(path) DO NOTHING",
        params![path],
    )?;
    db.query_row("SELECT id FROM files WHERE path = ?1", params![path], |r| r.get(0))
}

/// Path interned as `file`.
pub fn file_path(db: &Connection, file: i64) -> rusqlite::Result<Option<String>> {
    db.query_row("SELECT path FROM files WHERE id = ?1", params![file], |r| r.get(0))
        .optional()
}
