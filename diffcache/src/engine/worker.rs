//! Job execution. A worker owns one SQLite connection and the git
//! repositories it has opened so far; both stay on the worker's thread.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use diffcache_core::types::ReplayState;
use diffcache_core::{
    changesets, content as contents, highlight as highlights, journal, open_sync, replay as replays, repositories,
    JobKey,
};
use rusqlite::Connection;
use tracing::{debug, error, warn};

use crate::engine::error::ComputeError;
use crate::engine::{content, highlight, replay, structure, EngineConfig};
use crate::git::GitReader;

/// One unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    Job { changeset: i64, key: JobKey },
    /// Highlighting asked for outside any changeset.
    CustomHighlight { highlight_file: i64 },
    Replay { repository: i64, merge: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Nothing to do: suppressed, already finished, or gone.
    Skipped,
    /// Failed transiently; not journaled, so it is planned again.
    Retry,
    Failed,
}

pub struct Worker {
    db: Connection,
    repositories: HashMap<i64, GitReader>,
    config: EngineConfig,
}

impl Worker {
    pub fn open(db_path: &str, config: EngineConfig) -> Result<Self, ComputeError> {
        Ok(Worker { db: open_sync(db_path)?, repositories: HashMap::new(), config })
    }

    pub fn connection(&self) -> &Connection {
        &self.db
    }

    pub fn run(&mut self, task: &Task) -> Outcome {
        let result = match task {
            Task::Job { changeset, key } => self.run_job(*changeset, key),
            Task::CustomHighlight { highlight_file } => self.run_custom_highlight(*highlight_file),
            Task::Replay { repository, merge } => self.run_replay(*repository, merge),
        };
        match result {
            Ok(true) => Outcome::Done,
            Ok(false) => Outcome::Skipped,
            Err(err) if err.is_transient() => {
                warn!(?task, error = %err, "transient failure, will retry");
                thread::sleep(self.config.retry_delay);
                Outcome::Retry
            }
            Err(err) if self.superseded(task) => {
                debug!(?task, error = %err, "content difference collected while running, dropping");
                Outcome::Skipped
            }
            Err(err) => {
                self.record_failure(task, &err);
                Outcome::Failed
            }
        }
    }

    /// A content job whose anchor no longer exists. Its writes are moot and
    /// a later request plans it again from scratch.
    fn superseded(&self, task: &Task) -> bool {
        match task {
            Task::Job { changeset, key } if key.writes_content() => {
                matches!(contents::fetch(&self.db, *changeset), Ok(None))
            }
            _ => false,
        }
    }

    fn run_job(&mut self, id: i64, key: &JobKey) -> Result<bool, ComputeError> {
        if journal::is_suppressed(&self.db, id, key)? {
            return Ok(false);
        }
        let Some(changeset) = changesets::fetch(&self.db, id)? else {
            return Ok(false);
        };
        if key.writes_content() && contents::fetch(&self.db, id)?.is_none() {
            return Ok(false);
        }
        let git = reader(&mut self.repositories, &self.db, changeset.repository)?;
        let db = &mut self.db;
        match key {
            JobKey::Structure => structure::compute(db, git, &changeset)?,
            JobKey::Examine { file } => content::examine_file(db, git, &changeset, *file)?,
            JobKey::Compare { file } => {
                content::compare_file(db, git, &changeset, *file, self.config.fold_context_lines)?
            }
            JobKey::Analyze { file, block } => {
                content::analyze_block(db, git, &changeset, *file, *block)?;
            }
            // Shared entries are often finished by another changeset's job.
            JobKey::Highlight { highlight_file, .. } => {
                return highlight::highlight_entry(db, git, *highlight_file, &self.config.theme);
            }
        }
        Ok(true)
    }

    fn run_custom_highlight(&mut self, id: i64) -> Result<bool, ComputeError> {
        let Some(entry) = highlights::fetch(&self.db, id)? else {
            return Ok(false);
        };
        let git = reader(&mut self.repositories, &self.db, entry.repository)?;
        highlight::highlight_entry(&mut self.db, git, id, &self.config.theme)
    }

    fn run_replay(&mut self, repository: i64, merge: &str) -> Result<bool, ComputeError> {
        let Some(request) = replays::fetch(&self.db, repository, merge)? else {
            return Ok(false);
        };
        if request.state != ReplayState::Pending {
            return Ok(false);
        }
        let git = reader(&mut self.repositories, &self.db, repository)?;
        replay::execute(&mut self.db, git, &request)?;
        Ok(true)
    }

    fn record_failure(&self, task: &Task, err: &ComputeError) {
        match task {
            Task::Job { changeset, key } => {
                let fatal = key.affects_diff();
                if fatal {
                    error!(changeset, job = key.kind(), error = %err, "job failed");
                } else {
                    warn!(changeset, job = key.kind(), error = %err, "job failed");
                }
                if let Err(journal_err) = journal::record(&self.db, *changeset, key, fatal, &err.to_string()) {
                    error!(changeset, error = %journal_err, "could not journal failure");
                }
            }
            Task::CustomHighlight { highlight_file } => {
                warn!(highlight_file, error = %err, "highlight failed");
            }
            Task::Replay { repository, merge } => {
                error!(repository, %merge, error = %err, "replay could not be recorded");
            }
        }
    }
}

/// Returns the cached reader for `repository`, opening it on first use.
fn reader<'a>(
    cache: &'a mut HashMap<i64, GitReader>,
    db: &Connection,
    repository: i64,
) -> Result<&'a GitReader, ComputeError> {
    match cache.entry(repository) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let repo = repositories::by_id(db, repository)?.ok_or_else(|| {
                ComputeError::Invariant(format!("repository {repository} is not registered"))
            })?;
            debug!(repository, path = %repo.path, "opening repository");
            Ok(entry.insert(GitReader::open(&repo.path)?))
        }
    }
}

/// Thread body: runs tasks until the task channel closes.
pub fn worker_loop(
    index: usize,
    db_path: String,
    config: EngineConfig,
    tasks: Receiver<Task>,
    done: Sender<(Task, Outcome)>,
) {
    let mut worker = match Worker::open(&db_path, config) {
        Ok(worker) => worker,
        Err(err) => {
            error!(worker = index, error = %err, "worker could not open the database");
            return;
        }
    };
    highlight::warm_up();
    debug!(worker = index, "worker started");

    for task in tasks {
        let outcome = worker.run(&task);
        if done.send((task, outcome)).is_err() {
            break;
        }
    }
    debug!(worker = index, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::process_inline;
    use crate::git::testing::TestRepo;
    use diffcache_core::gc::{self, GcPolicy};

    #[test]
    fn content_jobs_of_a_collected_diff_are_dropped_not_journaled() {
        let repo = TestRepo::new();
        let from = repo.commit(&[("a.txt", "one\ntwo\n")], &[]);
        let to = repo.commit(&[("a.txt", "one\n2\n")], &[&from]);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.db").to_string_lossy().into_owned();
        let mut conn = open_sync(&path).unwrap();
        let repository = repositories::register(&conn, "demo", repo.path()).unwrap().id;
        let cs = changesets::get_or_create(&mut conn, repository, &to, Some(&from), None, false).unwrap();

        let mut worker = Worker::open(&path, EngineConfig::default()).unwrap();
        assert_eq!(worker.run(&Task::Job { changeset: cs.id, key: JobKey::Structure }), Outcome::Done);
        contents::request(&conn, cs.id, 1).unwrap();
        let file = changesets::structure_diff(&conn, cs.id).unwrap()[0].file;

        let policy = GcPolicy::default();
        let swept = gc::sweep(&mut conn, &policy, 2 + policy.content_retention_secs, &[]).unwrap();
        assert_eq!(swept.content_differences, 1);

        for key in [JobKey::Examine { file }, JobKey::Compare { file }, JobKey::Analyze { file, block: 0 }] {
            assert_eq!(worker.run(&Task::Job { changeset: cs.id, key }), Outcome::Skipped);
        }
        assert!(journal::errors(&conn, cs.id).unwrap().is_empty());

        contents::request(&conn, cs.id, 3).unwrap();
        let report = process_inline(&path, &EngineConfig::default(), &[cs.id]).unwrap();
        assert_eq!(report.failed, 0);
        assert!(contents::fetch(&conn, cs.id).unwrap().unwrap().complete);
        assert_eq!(contents::file_differences(&conn, cs.id).unwrap().len(), 1);
        assert_eq!(contents::changed_lines(&conn, cs.id, file).unwrap().len(), 1);
    }

    #[test]
    fn journaled_jobs_are_not_run_again() {
        let repo = TestRepo::new();
        let head = repo.commit(&[("a.txt", "a\n")], &[]);
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.db").to_string_lossy().into_owned();
        let mut conn = open_sync(&path).unwrap();
        let repository = repositories::register(&conn, "demo", repo.path()).unwrap().id;
        let cs = changesets::get_or_create(&mut conn, repository, &head, None, None, false).unwrap();
        journal::record(&conn, cs.id, &JobKey::Structure, true, "earlier failure").unwrap();

        let mut worker = Worker::open(&path, EngineConfig::default()).unwrap();
        assert_eq!(worker.run(&Task::Job { changeset: cs.id, key: JobKey::Structure }), Outcome::Skipped);
        assert!(!changesets::fetch(&conn, cs.id).unwrap().unwrap().complete);
    }
}
