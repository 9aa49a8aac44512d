/// DDL to create the schema_version tracking table.
///
/// Applied unconditionally on every DB open (before checking the version),
/// using `IF NOT EXISTS` so it is safe to run multiple times.
pub const SCHEMA_VERSION_DDL: &str = "
    CREATE TABLE IF NOT EXISTS schema_version (
        version INTEGER NOT NULL
    ) STRICT;
";

/// DDL for the full v1 schema.
///
/// Identity tables (`repositories`, `commits`, `files`) anchor everything
/// else. Each cache layer hangs off its parent with `ON DELETE CASCADE`, so
/// deleting a repository or a commit removes every changeset, difference and
/// highlight row it exclusively owns.
///
/// Changesets carry two partial unique indexes: one for regular changesets
/// and one for changesets scoped to a merge. Nullable key columns are folded
/// through `COALESCE` because SQLite treats NULLs as distinct in indexes.
///
/// All tables use `STRICT` mode for type enforcement.
pub const SCHEMA_V1_SQL: &str = "
    CREATE TABLE IF NOT EXISTS repositories (
        id      INTEGER PRIMARY KEY,
        name    TEXT    NOT NULL UNIQUE,
        path    TEXT    NOT NULL
    ) STRICT;

    CREATE TABLE IF NOT EXISTS commits (
        id          INTEGER PRIMARY KEY,
        repository  INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        sha1        TEXT    NOT NULL,
        UNIQUE (repository, sha1)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS files (
        id      INTEGER PRIMARY KEY,
        path    TEXT    NOT NULL UNIQUE
    ) STRICT;

    CREATE TABLE IF NOT EXISTS changesets (
        id          INTEGER PRIMARY KEY,
        repository  INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        to_commit   INTEGER NOT NULL REFERENCES commits(id) ON DELETE CASCADE,
        from_commit INTEGER REFERENCES commits(id) ON DELETE CASCADE,
        for_merge   INTEGER REFERENCES commits(id) ON DELETE CASCADE,
        is_replay   INTEGER NOT NULL DEFAULT 0,
        processed   INTEGER NOT NULL DEFAULT 0,
        complete    INTEGER NOT NULL DEFAULT 0
    ) STRICT;

    CREATE UNIQUE INDEX IF NOT EXISTS changesets_regular
        ON changesets (repository, to_commit, COALESCE(from_commit, -1))
        WHERE for_merge IS NULL;

    CREATE UNIQUE INDEX IF NOT EXISTS changesets_for_merge
        ON changesets (repository, to_commit, COALESCE(from_commit, -1), for_merge)
        WHERE for_merge IS NOT NULL;

    CREATE TABLE IF NOT EXISTS changesetfiles (
        changeset   INTEGER NOT NULL REFERENCES changesets(id) ON DELETE CASCADE,
        file        INTEGER NOT NULL REFERENCES files(id),
        old_sha1    TEXT,
        old_mode    INTEGER,
        new_sha1    TEXT,
        new_mode    INTEGER,
        PRIMARY KEY (changeset, file)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS changesetcontentdifferences (
        changeset   INTEGER PRIMARY KEY REFERENCES changesets(id) ON DELETE CASCADE,
        requested   INTEGER NOT NULL,
        complete    INTEGER NOT NULL DEFAULT 0
    ) STRICT;

    CREATE TABLE IF NOT EXISTS highlightfiles (
        id          INTEGER PRIMARY KEY,
        repository  INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        sha1        TEXT    NOT NULL,
        language    TEXT,
        conflicts   INTEGER NOT NULL,
        requested   INTEGER NOT NULL DEFAULT 1,
        highlighted INTEGER NOT NULL DEFAULT 0,
        CHECK (NOT (requested AND highlighted))
    ) STRICT;

    CREATE UNIQUE INDEX IF NOT EXISTS highlightfiles_key
        ON highlightfiles (repository, sha1, COALESCE(language, ''), conflicts);

    CREATE TABLE IF NOT EXISTS highlightlines (
        file    INTEGER NOT NULL REFERENCES highlightfiles(id) ON DELETE CASCADE,
        line    INTEGER NOT NULL,
        data    TEXT    NOT NULL,
        PRIMARY KEY (file, line)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS changesetfiledifferences (
        changeset           INTEGER NOT NULL
                            REFERENCES changesetcontentdifferences(changeset) ON DELETE CASCADE,
        file                INTEGER NOT NULL REFERENCES files(id),
        comparison_pending  INTEGER NOT NULL,
        old_is_binary       INTEGER,
        old_length          INTEGER,
        old_linebreak       INTEGER,
        new_is_binary       INTEGER,
        new_length          INTEGER,
        new_linebreak       INTEGER,
        old_highlightfile   INTEGER REFERENCES highlightfiles(id) ON DELETE SET NULL,
        new_highlightfile   INTEGER REFERENCES highlightfiles(id) ON DELETE SET NULL,
        PRIMARY KEY (changeset, file)
    ) STRICT;

    CREATE INDEX IF NOT EXISTS changesetfiledifferences_old_highlight
        ON changesetfiledifferences (old_highlightfile);
    CREATE INDEX IF NOT EXISTS changesetfiledifferences_new_highlight
        ON changesetfiledifferences (new_highlightfile);

    CREATE TABLE IF NOT EXISTS changesetchangedlines (
        changeset       INTEGER NOT NULL,
        file            INTEGER NOT NULL,
        \"index\"       INTEGER NOT NULL,
        \"offset\"      INTEGER NOT NULL,
        delete_count    INTEGER NOT NULL,
        delete_length   INTEGER NOT NULL,
        insert_count    INTEGER NOT NULL,
        insert_length   INTEGER NOT NULL,
        analysis        TEXT,
        PRIMARY KEY (changeset, file, \"index\"),
        FOREIGN KEY (changeset, file)
            REFERENCES changesetfiledifferences(changeset, file) ON DELETE CASCADE
    ) STRICT;

    CREATE TABLE IF NOT EXISTS customhighlightrequests (
        id          TEXT    PRIMARY KEY,
        file        INTEGER NOT NULL REFERENCES highlightfiles(id) ON DELETE CASCADE,
        last_access INTEGER NOT NULL
    ) STRICT;

    CREATE TABLE IF NOT EXISTS mergereplayrequests (
        repository  INTEGER NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
        merge       INTEGER NOT NULL REFERENCES commits(id) ON DELETE CASCADE,
        onto        INTEGER REFERENCES commits(id) ON DELETE CASCADE,
        replay      INTEGER REFERENCES commits(id) ON DELETE SET NULL,
        traceback   TEXT,
        PRIMARY KEY (repository, merge),
        CHECK (replay IS NULL OR traceback IS NULL)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS changeseterrors (
        changeset   INTEGER NOT NULL REFERENCES changesets(id) ON DELETE CASCADE,
        job_kind    TEXT    NOT NULL
                            CHECK(job_kind IN ('structure', 'examine', 'compare',
                                               'analyze', 'highlight')),
        file        INTEGER NOT NULL DEFAULT 0,
        block       INTEGER NOT NULL DEFAULT 0,
        sha1        TEXT    NOT NULL DEFAULT '',
        fatal       INTEGER NOT NULL,
        traceback   TEXT    NOT NULL,
        PRIMARY KEY (changeset, job_kind, file, block, sha1)
    ) STRICT;

    CREATE TABLE IF NOT EXISTS codecontexts (
        sha1        TEXT    NOT NULL,
        language    TEXT    NOT NULL,
        first_line  INTEGER NOT NULL,
        last_line   INTEGER NOT NULL,
        context     TEXT    NOT NULL,
        PRIMARY KEY (sha1, language, first_line, last_line)
    ) STRICT;
";

/// DDL for v2: per-changeset highlight requests.
///
/// `requested` gates highlight jobs for the changeset's file differences and
/// never goes back to false. `evaluated` is set once every file has been
/// examined while requested, and cleared when a request is turned on.
pub const SCHEMA_V2_SQL: &str = "
    CREATE TABLE IF NOT EXISTS changesethighlightrequests (
        changeset   INTEGER PRIMARY KEY REFERENCES changesets(id) ON DELETE CASCADE,
        requested   INTEGER NOT NULL DEFAULT 0,
        evaluated   INTEGER NOT NULL DEFAULT 0
    ) STRICT;
";

/// Runs forward-only schema migration to migrate the DB to the latest version.
///
/// This function is idempotent: safe to call on every startup regardless of
/// whether the schema has already been applied.
///
/// # Process
///
/// 1. Creates the `schema_version` table if it does not exist.
/// 2. Reads the current version (`0` if the table is empty).
/// 3. If the version is below 1, applies `SCHEMA_V1_SQL` inside a
///    `BEGIN IMMEDIATE` transaction and records `version = 1`.
/// 4. Likewise applies `SCHEMA_V2_SQL` and records `version = 2`.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the DDL fails or the version row cannot be read.
pub fn migrate(db: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    db.execute_batch(SCHEMA_VERSION_DDL)?;

    let version: i64 = db
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |r| r.get(0),
        )
        .unwrap_or(0);

    if version < 1 {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute_batch(SCHEMA_V1_SQL)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
        tx.commit()?;
    }
    if version < 2 {
        let tx = db.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        tx.execute_batch(SCHEMA_V2_SQL)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (2)", [])?;
        tx.commit()?;
    }

    Ok(())
}
