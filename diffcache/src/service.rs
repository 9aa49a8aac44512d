//! Async request surface over the cache.
//!
//! Reads come straight from the store; anything that needs computing is
//! left to the runner, which is woken when a request creates work. The one
//! exception is [`Service::request_analysis`], which computes on the spot.

use std::sync::{Arc, Mutex, PoisonError};

use diffcache_core::gc::{self, GcPolicy, GcReport};
use diffcache_core::types::{
    ChangedFile, ChangedLineBlock, CodeContext, CustomHighlightRequest, FileDifference,
    HighlightState, MergeReplayRequest, ReplayState, Repository, Token,
};
use diffcache_core::{
    changesets, content, highlight, journal, open_sync, replay, repositories, JobErrorRecord,
    JobKey, Store, StoreError,
};
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::engine::content::analyze_block;
use crate::engine::error::ComputeError;
use crate::engine::highlight::language_for_path;
use crate::engine::RunnerHandle;
use crate::git::GitReader;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Compute(#[from] ComputeError),

    #[error("not a git repository: {0}")]
    NotARepository(String),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<rusqlite::Error> for ServiceError {
    fn from(err: rusqlite::Error) -> Self {
        ServiceError::Store(StoreError::Sql(err))
    }
}

type Result<T> = std::result::Result<T, ServiceError>;

fn not_found(what: String) -> ServiceError {
    ServiceError::Store(StoreError::NotFound(what))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangesetStatus {
    pub id: i64,
    pub processed: bool,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentStatus {
    pub complete: bool,
    pub file_differences: Vec<FileDifference>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HighlightStatus {
    /// Handle to pass to [`Service::touch_highlight`].
    pub request: CustomHighlightRequest,
    pub highlighted: bool,
    /// Set once highlighted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lines: Option<Vec<Vec<Token>>>,
}

#[derive(Clone)]
pub struct Service {
    store: Store,
    runner: Option<RunnerHandle>,
    gc_policy: GcPolicy,
    highlight_by_default: bool,
    /// Connection for synchronous analysis, opened on first use.
    blocking: Arc<Mutex<Option<Connection>>>,
}

impl Service {
    /// `runner` is `None` when work is processed inline by the caller.
    pub fn new(store: Store, runner: Option<RunnerHandle>, gc_policy: GcPolicy) -> Self {
        Service {
            store,
            runner,
            gc_policy,
            highlight_by_default: true,
            blocking: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether changesets asked for through this service get their file
    /// versions highlighted.
    pub fn highlight_by_default(mut self, requested: bool) -> Self {
        self.highlight_by_default = requested;
        self
    }

    fn wake(&self, changeset: i64) {
        if let Some(runner) = &self.runner {
            runner.wake(changeset);
        }
    }

    pub async fn register_repository(&self, name: &str, path: &str) -> Result<Repository> {
        if let Err(err) = GitReader::open(path) {
            return Err(ServiceError::NotARepository(format!("{path}: {}", err.message())));
        }
        let (name, path) = (name.to_owned(), path.to_owned());
        let repo = self.store.call(move |db| repositories::register(db, &name, &path)).await?;
        info!(repository = repo.id, name = %repo.name, path = %repo.path, "repository registered");
        Ok(repo)
    }

    pub async fn repository(&self, name: &str) -> Result<Repository> {
        let lookup = name.to_owned();
        self.store
            .call(move |db| repositories::find(db, &lookup))
            .await?
            .ok_or_else(|| not_found(format!("repository {name}")))
    }

    /// Forgets a repository and everything cached for it.
    pub async fn delete_repository(&self, name: &str) -> Result<bool> {
        let name = name.to_owned();
        Ok(self.store.call(move |db| repositories::delete(db, &name)).await?)
    }

    /// Returns the changeset for the commit pair, creating it when needed.
    pub async fn get_changeset(
        &self,
        repository: i64,
        to: &str,
        from: Option<&str>,
        for_merge: Option<&str>,
    ) -> Result<ChangesetStatus> {
        let (to, from, for_merge) = (to.to_owned(), from.map(str::to_owned), for_merge.map(str::to_owned));
        let by_default = self.highlight_by_default;
        let changeset = self
            .store
            .call(move |db| {
                let changeset =
                    changesets::get_or_create(db, repository, &to, from.as_deref(), for_merge.as_deref(), false)?;
                highlight::request_changeset(db, changeset.id, by_default)?;
                Ok(changeset)
            })
            .await?;
        if !changeset.complete {
            self.wake(changeset.id);
        }
        Ok(ChangesetStatus { id: changeset.id, processed: changeset.processed, complete: changeset.complete })
    }

    pub async fn get_structure_diff(&self, changeset: i64) -> Result<Vec<ChangedFile>> {
        Ok(self.store.call(move |db| changesets::structure_diff(db, changeset)).await?)
    }

    /// Asks for the content difference of `changeset` and returns what is
    /// stored so far. Each call counts as a use for garbage collection.
    pub async fn request_content_diff(&self, changeset: i64, now: i64) -> Result<ContentStatus> {
        let by_default = self.highlight_by_default;
        let (difference, created, highlighting, file_differences) = self
            .store
            .try_call(move |db| {
                if changesets::fetch(db, changeset)?.is_none() {
                    return Err(StoreError::NotFound(format!("changeset {changeset}")));
                }
                let (difference, created) = content::request(db, changeset, now)?;
                let highlighting = highlight::request_changeset(db, changeset, by_default)?;
                Ok((difference, created, highlighting, content::file_differences(db, changeset)?))
            })
            .await?;
        if created {
            debug!(changeset, "content difference requested");
        }
        if !difference.complete || (highlighting.requested && !highlighting.evaluated) {
            self.wake(changeset);
        }
        Ok(ContentStatus { complete: difference.complete, file_differences })
    }

    pub async fn get_changed_lines(&self, changeset: i64, file: i64, now: i64) -> Result<Vec<ChangedLineBlock>> {
        Ok(self
            .store
            .call(move |db| {
                if content::fetch(db, changeset)?.is_some() {
                    content::request(db, changeset, now)?;
                }
                content::changed_lines(db, changeset, file)
            })
            .await?)
    }

    /// Returns the analysis of one block, computing it now if the runner
    /// has not got to it yet. Counts as a use of the content difference.
    pub async fn request_analysis(&self, changeset: i64, file: i64, block: i64, now: i64) -> Result<String> {
        let stored = self
            .store
            .call(move |db| {
                if content::fetch(db, changeset)?.is_some() {
                    content::request(db, changeset, now)?;
                }
                content::changed_lines(db, changeset, file)
            })
            .await?
            .into_iter()
            .find(|b| b.index == block)
            .ok_or_else(|| not_found(format!("block {block} of file {file} in changeset {changeset}")))?;
        if let Some(analysis) = stored.analysis {
            return Ok(analysis);
        }

        let path = self.store.path().to_owned();
        let blocking = Arc::clone(&self.blocking);
        tokio::task::spawn_blocking(move || -> Result<String> {
            let mut slot = blocking.lock().unwrap_or_else(PoisonError::into_inner);
            let mut db = match slot.take() {
                Some(db) => db,
                None => open_sync(&path)?,
            };
            let analysis = analyze_on(&mut db, changeset, file, block);
            *slot = Some(db);
            analysis
        })
        .await?
    }

    /// Asks for a highlighted version of blob `sha1`. The returned request
    /// handle keeps the entry alive while it is touched.
    ///
    /// `path`, when known, picks the language; without it the highlighter
    /// goes by the first line of the content.
    pub async fn request_highlight(
        &self,
        repository: i64,
        sha1: &str,
        path: Option<&str>,
        conflicts: bool,
        now: i64,
    ) -> Result<HighlightStatus> {
        let sha1 = sha1.to_owned();
        let language = path.and_then(language_for_path);
        let (entry, request, lines) = self
            .store
            .try_call(move |db| {
                let entry = highlight::request(db, repository, &sha1, language.as_deref(), conflicts)?;
                let request = highlight::create_custom(db, entry.id, now)?;
                let lines = match entry.state {
                    HighlightState::Highlighted => Some(highlight::lines(db, entry.id)?),
                    _ => None,
                };
                Ok((entry, request, lines))
            })
            .await?;
        if entry.state == HighlightState::Requested {
            if let Some(runner) = &self.runner {
                runner.highlight(entry.id);
            }
        }
        Ok(HighlightStatus { request, highlighted: lines.is_some(), lines })
    }

    /// Refreshes a highlight request handle and returns the current state.
    pub async fn touch_highlight(&self, id: &str, now: i64) -> Result<HighlightStatus> {
        let lookup = id.to_owned();
        let status = self
            .store
            .try_call(move |db| {
                let Some(request) = highlight::touch_custom(db, &lookup, now)? else {
                    return Ok(None);
                };
                let lines = match highlight::fetch(db, request.file)?.map(|e| e.state) {
                    Some(HighlightState::Highlighted) => Some(highlight::lines(db, request.file)?),
                    _ => None,
                };
                Ok(Some(HighlightStatus { request, highlighted: lines.is_some(), lines }))
            })
            .await?;
        status.ok_or_else(|| not_found(format!("highlight request {id}")))
    }

    pub async fn get_errors(&self, changeset: i64) -> Result<Vec<JobErrorRecord>> {
        Ok(self.store.call(move |db| journal::errors(db, changeset)).await?)
    }

    /// Drops journaled failures so the jobs are planned again.
    pub async fn clear_errors(&self, changeset: i64, key: Option<JobKey>) -> Result<usize> {
        let cleared = self.store.call(move |db| journal::clear(db, changeset, key.as_ref())).await?;
        if cleared > 0 {
            info!(changeset, cleared, "job errors cleared");
            self.wake(changeset);
        }
        Ok(cleared)
    }

    /// Requests a replay of a two-parent merge. `retry` resets an earlier
    /// failure.
    pub async fn request_merge_replay(&self, repository: i64, merge: &str, retry: bool) -> Result<MergeReplayRequest> {
        self.replay(repository, merge, None, retry).await
    }

    /// Requests a replay of `commit` on top of `onto`.
    pub async fn request_rebase_replay(
        &self,
        repository: i64,
        commit: &str,
        onto: &str,
        retry: bool,
    ) -> Result<MergeReplayRequest> {
        self.replay(repository, commit, Some(onto), retry).await
    }

    async fn replay(&self, repository: i64, merge: &str, onto: Option<&str>, retry: bool) -> Result<MergeReplayRequest> {
        let (merge, onto) = (merge.to_owned(), onto.map(str::to_owned));
        let request = self
            .store
            .try_call(move |db| replay::request(db, repository, &merge, onto.as_deref(), retry))
            .await?;
        if request.state == ReplayState::Pending {
            if let Some(runner) = &self.runner {
                runner.replays();
            }
        }
        Ok(request)
    }

    pub async fn code_context(&self, sha1: &str, language: &str, line: i64) -> Result<Option<CodeContext>> {
        let (sha1, language) = (sha1.to_owned(), language.to_owned());
        Ok(self.store.call(move |db| highlight::code_context(db, &sha1, &language, line)).await?)
    }

    /// Sweeps expired cache rows, sparing changesets the runner is working on.
    pub async fn collect_garbage(&self, now: i64) -> Result<GcReport> {
        let active = self.runner.as_ref().map(RunnerHandle::active_changesets).unwrap_or_default();
        let policy = self.gc_policy;
        let report = self.store.call(move |db| gc::sweep(db, &policy, now, &active)).await?;
        info!(?report, "garbage collected");
        Ok(report)
    }
}

fn analyze_on(db: &mut Connection, changeset: i64, file: i64, block: i64) -> Result<String> {
    let cs = changesets::fetch(db, changeset)?.ok_or_else(|| not_found(format!("changeset {changeset}")))?;
    let repo = repositories::by_id(db, cs.repository)?
        .ok_or_else(|| not_found(format!("repository {}", cs.repository)))?;
    let git = GitReader::open(&repo.path).map_err(ComputeError::from)?;
    analyze_block(db, &git, &cs, file, block).map_err(|err| {
        warn!(changeset, file, block, error = %err, "analysis failed");
        ServiceError::from(err)
    })
}
