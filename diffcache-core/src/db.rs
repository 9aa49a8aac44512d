use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_rusqlite::Connection;

use crate::error::Result;

const CONNECTION_PRAGMAS: &str = "
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;
    PRAGMA foreign_keys=ON;";

fn configure(db: &rusqlite::Connection) -> rusqlite::Result<()> {
    db.execute_batch(CONNECTION_PRAGMAS)?;
    // busy_timeout via the Connection method, not a PRAGMA string.
    db.busy_timeout(Duration::from_secs(5))
}

/// Opens (or creates) the SQLite database at `path` for async use,
/// configures WAL mode, and applies schema migrations via the
/// `schema_version` table.
///
/// The daemon opens its service connection here first, so leftover WAL from
/// a previous run is checkpointed before any worker connects.
///
/// # Errors
///
/// Returns `tokio_rusqlite::Error` if the file cannot be opened, WAL configuration
/// fails, or schema DDL fails.
pub async fn open_db(path: &str) -> std::result::Result<Connection, tokio_rusqlite::Error> {
    let conn = Connection::open(path).await?;

    conn.call(|db| {
        configure(db)?;
        db.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        crate::schema::migrate(db)?;
        Ok::<_, rusqlite::Error>(())
    })
    .await?;

    Ok(conn)
}

/// Opens a blocking connection with the same settings as [`open_db`].
///
/// Worker threads each own one of these.
pub fn open_sync(path: impl AsRef<Path>) -> rusqlite::Result<rusqlite::Connection> {
    let mut db = rusqlite::Connection::open(path)?;
    configure(&db)?;
    crate::schema::migrate(&mut db)?;
    Ok(db)
}

/// Returns the current Unix timestamp in seconds.
pub fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Async handle over one background SQLite connection.
///
/// Cloning is cheap; all clones share the same connection thread.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
    path: String,
}

impl Store {
    pub async fn open(path: &str) -> Result<Self> {
        let conn = open_db(path).await?;
        Ok(Store { conn, path: path.to_owned() })
    }

    /// Path of the database file, for opening sibling worker connections.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Runs a store function on the connection thread.
    pub async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let result = self.conn.call(move |db| Ok::<_, rusqlite::Error>(f(db))).await?;
        Ok(result?)
    }

    /// Like [`Store::call`], for functions that can also fail outside SQLite.
    pub async fn try_call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut rusqlite::Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn.call(move |db| Ok::<_, rusqlite::Error>(f(db))).await?
    }
}
