//! diffcache: a cache of computed git differences.
//!
//! Entry point for the `diffcache` binary. Every subcommand opens the shared
//! WAL-mode database and goes through [`service::Service`]; `serve` also
//! starts the background runner and the garbage-collection interval, and
//! `process` runs outstanding work inline on the calling thread.

mod config;
mod engine;
mod git;
mod service;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diffcache_core::{changesets, now_secs, open_sync, Store};
use serde::Serialize;
use signal_hook::consts::SIGTERM;
use signal_hook::flag::register;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::git::GitReader;
use crate::service::Service;

#[derive(Debug, Parser)]
#[command(name = "diffcache", version, about = "Cache of computed git differences")]
struct Cli {
    /// Config file; defaults to `$XDG_CONFIG_HOME/diffcache/config.toml`.
    #[arg(long, global = true, env = "DIFFCACHE_CONFIG")]
    config: Option<PathBuf>,

    /// Database file, overriding the config.
    #[arg(long, global = true, env = "DIFFCACHE_DATABASE")]
    database: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the background runner and garbage collection until stopped.
    Serve,
    /// Register a git repository under a name.
    Register { name: String, path: String },
    /// Forget a repository and everything cached for it.
    Forget { name: String },
    /// Get or create the changeset between two commits.
    Changeset {
        #[arg(long)]
        repo: String,
        /// Target commit.
        to: String,
        /// Base commit; defaults to the only parent of `to`.
        #[arg(long)]
        from: Option<String>,
        /// Merge commit the changeset belongs to.
        #[arg(long)]
        for_merge: Option<String>,
    },
    /// List the changed paths of a changeset.
    Files { changeset: i64 },
    /// Request the content difference of a changeset, or the changed lines
    /// of one of its files.
    Content {
        changeset: i64,
        #[arg(long)]
        file: Option<i64>,
    },
    /// Analyze one block of changed lines now.
    Analyze { changeset: i64, file: i64, block: i64 },
    /// Request syntax highlighting of a blob, given as `<rev>:<path>` or an id.
    Highlight {
        #[arg(long)]
        repo: String,
        blob: String,
        /// Treat conflict marker lines as plain text.
        #[arg(long)]
        conflicts: bool,
    },
    /// Refresh a highlight request handle.
    Touch { request: String },
    /// Innermost code context around a zero-based line of a highlighted blob.
    Context { sha1: String, language: String, line: i64 },
    /// Show journaled job failures of a changeset.
    Errors { changeset: i64 },
    /// Drop journaled failures so the jobs run again.
    ClearErrors { changeset: i64 },
    /// Request a replay of a merge, or of a commit onto another base.
    Replay {
        #[arg(long)]
        repo: String,
        commit: String,
        #[arg(long)]
        onto: Option<String>,
        /// Reset an earlier failure.
        #[arg(long)]
        retry: bool,
    },
    /// Run outstanding work inline; all incomplete changesets by default.
    Process { changesets: Vec<i64> },
    /// Sweep expired cache entries.
    Gc,
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Registers the SIGTERM flag polled by `serve`.
fn register_sigterm() -> Arc<AtomicBool> {
    let term = Arc::new(AtomicBool::new(false));
    register(SIGTERM, Arc::clone(&term)).expect("Failed to register SIGTERM handler");
    term
}

async fn open_git(service: &Service, name: &str) -> Result<(i64, GitReader)> {
    let repo = service.repository(name).await?;
    let git = GitReader::open(&repo.path).with_context(|| format!("opening {}", repo.path))?;
    Ok((repo.id, git))
}

fn resolve(git: &GitReader, rev: &str) -> Result<String> {
    git.resolve(rev).with_context(|| format!("resolving {rev}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("diffcache=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(config::config_path);
    let mut config = config::load(&config_path);
    if let Some(database) = cli.database {
        config.database = database;
    }
    if let Some(parent) = std::path::Path::new(&config.database).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let store = Store::open(&config.database)
        .await
        .with_context(|| format!("opening database {}", config.database))?;

    let service = Service::new(store.clone(), None, config.gc_policy())
        .highlight_by_default(config.highlight.requested_by_default);

    match cli.command {
        Command::Serve => serve(store, &config).await?,
        Command::Register { name, path } => print(&service.register_repository(&name, &path).await?)?,
        Command::Forget { name } => print(&service.delete_repository(&name).await?)?,
        Command::Changeset { repo, to, from, for_merge } => {
            let (repository, git) = open_git(&service, &repo).await?;
            let to = resolve(&git, &to)?;
            let from = from.map(|rev| resolve(&git, &rev)).transpose()?;
            let for_merge = for_merge.map(|rev| resolve(&git, &rev)).transpose()?;
            drop(git);
            let status = service.get_changeset(repository, &to, from.as_deref(), for_merge.as_deref()).await?;
            print(&status)?;
        }
        Command::Files { changeset } => print(&service.get_structure_diff(changeset).await?)?,
        Command::Content { changeset, file: None } => {
            print(&service.request_content_diff(changeset, now_secs()).await?)?
        }
        Command::Content { changeset, file: Some(file) } => {
            print(&service.get_changed_lines(changeset, file, now_secs()).await?)?
        }
        Command::Analyze { changeset, file, block } => {
            print(&service.request_analysis(changeset, file, block, now_secs()).await?)?
        }
        Command::Highlight { repo, blob, conflicts } => {
            let (repository, git) = open_git(&service, &repo).await?;
            let sha1 = git
                .repository()
                .revparse_single(&blob)
                .and_then(|object| object.peel_to_blob())
                .map(|blob| blob.id().to_string())
                .with_context(|| format!("resolving blob {blob}"))?;
            drop(git);
            let path = blob.split_once(':').map(|(_, path)| path).filter(|path| !path.is_empty());
            print(&service.request_highlight(repository, &sha1, path, conflicts, now_secs()).await?)?;
        }
        Command::Touch { request } => print(&service.touch_highlight(&request, now_secs()).await?)?,
        Command::Context { sha1, language, line } => {
            print(&service.code_context(&sha1, &language, line).await?)?
        }
        Command::Errors { changeset } => print(&service.get_errors(changeset).await?)?,
        Command::ClearErrors { changeset } => {
            print(&service.clear_errors(changeset, None).await?)?
        }
        Command::Replay { repo, commit, onto, retry } => {
            let (repository, git) = open_git(&service, &repo).await?;
            let commit = resolve(&git, &commit)?;
            let onto = onto.map(|rev| resolve(&git, &rev)).transpose()?;
            drop(git);
            let request = match onto {
                Some(onto) => service.request_rebase_replay(repository, &commit, &onto, retry).await?,
                None => service.request_merge_replay(repository, &commit, retry).await?,
            };
            print(&request)?;
        }
        Command::Process { changesets: ids } => {
            let path = config.database.clone();
            let engine = config.engine();
            let report = tokio::task::spawn_blocking(move || -> Result<_> {
                let ids = if ids.is_empty() {
                    changesets::find_incomplete(&open_sync(&path)?)?
                } else {
                    ids
                };
                Ok(engine::process_inline(&path, &engine, &ids)?)
            })
            .await??;
            print(&report)?;
        }
        Command::Gc => print(&service.collect_garbage(now_secs()).await?)?,
    }
    Ok(())
}

/// Runs the runner until SIGTERM or Ctrl-C, sweeping and rescanning on
/// their intervals.
async fn serve(store: Store, config: &Config) -> Result<()> {
    let term_flag = register_sigterm();
    let runner = engine::start(store.path(), config.engine()).context("starting runner")?;
    let service = Service::new(store, Some(runner.handle()), config.gc_policy())
        .highlight_by_default(config.highlight.requested_by_default);
    info!(database = %config.database, "serving");

    let mut gc_tick = tokio::time::interval(Duration::from_secs(config.gc.interval_secs.max(1)));
    let mut rescan_tick = tokio::time::interval(Duration::from_secs(config.runner.rescan_secs.max(1)));
    // The runner rescans on startup; skip both immediate ticks.
    gc_tick.tick().await;
    rescan_tick.tick().await;

    loop {
        tokio::select! {
            // Heartbeat so the SIGTERM flag is polled while idle.
            _ = tokio::time::sleep(Duration::from_millis(200)) => {
                if term_flag.load(Ordering::Relaxed) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
            _ = gc_tick.tick() => {
                if let Err(err) = service.collect_garbage(now_secs()).await {
                    error!(error = %err, "garbage collection failed");
                }
            }
            _ = rescan_tick.tick() => runner.handle().rescan(),
        }
    }

    info!("shutting down");
    tokio::task::spawn_blocking(move || runner.shutdown()).await?;
    Ok(())
}
