//! Persistent store for the diffcache pipeline.
//!
//! Every store function takes a plain `rusqlite::Connection` so the same
//! code serves both the async [`db::Store`] and the blocking worker
//! connections opened with [`db::open_sync`].

pub mod changesets;
pub mod content;
pub mod db;
pub mod error;
pub mod gc;
pub mod highlight;
pub mod job;
pub mod journal;
pub mod replay;
pub mod repositories;
pub mod schema;
pub mod types;

pub use db::{now_secs, open_db, open_sync, Store};
pub use error::{Result, StoreError};
pub use job::{JobErrorRecord, JobKey};
