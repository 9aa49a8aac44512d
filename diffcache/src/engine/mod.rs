//! Background computation: planning, the job runner and the jobs themselves.
//!
//! The runner is a coordinator thread plus a pool of worker threads. The
//! coordinator owns the in-flight set and is the only place jobs are
//! planned; workers own their SQLite connection and git repositories and
//! report each finished task back over a channel.

pub mod analysis;
pub mod content;
pub mod error;
pub mod highlight;
pub mod plan;
pub mod replay;
pub mod structure;
pub mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use diffcache_core::{changesets, highlight as highlights, open_sync, replay as replays, JobKey};
use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use self::error::ComputeError;
use self::worker::{Outcome, Task, Worker};

/// Settings shared by the coordinator and every worker.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    /// Unchanged lines between two changes at or below which the changes
    /// are folded into one block.
    pub fold_context_lines: usize,
    pub theme: String,
    /// Pause after a transient failure before the task is handed back.
    pub retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            workers: 4,
            fold_context_lines: 1,
            theme: "base16-ocean.dark".to_owned(),
            retry_delay: Duration::from_millis(250),
        }
    }
}

/// Messages accepted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerMessage {
    /// Plan changeset work now.
    Wake(i64),
    /// Highlight one entry outside any changeset.
    Highlight(i64),
    /// Pick up pending merge replays.
    Replays,
    /// Look for unfinished work of any kind.
    Rescan,
    Shutdown,
}

/// Cloneable sender side of a running [`Runner`].
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    tx: Sender<RunnerMessage>,
    active: Arc<Mutex<HashSet<i64>>>,
}

impl RunnerHandle {
    fn send(&self, message: RunnerMessage) {
        if self.tx.send(message).is_err() {
            warn!("runner has stopped");
        }
    }

    pub fn wake(&self, changeset: i64) {
        self.send(RunnerMessage::Wake(changeset));
    }

    pub fn highlight(&self, highlight_file: i64) {
        self.send(RunnerMessage::Highlight(highlight_file));
    }

    pub fn replays(&self) {
        self.send(RunnerMessage::Replays);
    }

    pub fn rescan(&self) {
        self.send(RunnerMessage::Rescan);
    }

    /// Changesets with outstanding or in-flight jobs. Garbage collection
    /// leaves their content differences alone.
    pub fn active_changesets(&self) -> Vec<i64> {
        let active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut ids: Vec<i64> = active.iter().copied().collect();
        ids.sort_unstable();
        ids
    }
}

/// A started coordinator and its workers.
pub struct Runner {
    handle: RunnerHandle,
    coordinator: JoinHandle<()>,
}

impl Runner {
    pub fn handle(&self) -> RunnerHandle {
        self.handle.clone()
    }

    /// Stops planning, lets each worker finish its current task and waits
    /// for every thread.
    pub fn shutdown(self) {
        self.handle.send(RunnerMessage::Shutdown);
        if self.coordinator.join().is_err() {
            error!("coordinator thread panicked");
        }
    }
}

/// Starts the coordinator and `config.workers` worker threads. The first
/// thing the coordinator does is a rescan, so work left over from a
/// previous run resumes.
pub fn start(db_path: &str, config: EngineConfig) -> Result<Runner, ComputeError> {
    let db = open_sync(db_path)?;
    let (control_tx, control_rx) = unbounded();
    let (task_tx, task_rx) = unbounded();
    let (done_tx, done_rx) = unbounded();

    let workers: Vec<JoinHandle<()>> = (0..config.workers.max(1))
        .map(|index| {
            let (path, config) = (db_path.to_owned(), config.clone());
            let (tasks, done) = (task_rx.clone(), done_tx.clone());
            thread::spawn(move || worker::worker_loop(index, path, config, tasks, done))
        })
        .collect();
    drop(done_tx);
    info!(workers = workers.len(), "runner started");

    let active = Arc::new(Mutex::new(HashSet::new()));
    let mut coordinator = Coordinator {
        db,
        tasks: task_tx,
        in_flight: HashSet::new(),
        per_changeset: HashMap::new(),
        tracked: HashSet::new(),
        failed_custom: HashSet::new(),
        active: Arc::clone(&active),
    };
    let coordinator = thread::spawn(move || {
        coordinator.run(control_rx, done_rx);
        // Closes the task channel. With the done receiver gone too, workers
        // stop after their current task.
        drop(coordinator);
        for worker in workers {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
        info!("runner stopped");
    });

    Ok(Runner { handle: RunnerHandle { tx: control_tx, active }, coordinator })
}

/// Dedup identity of a task. Highlight jobs of different changesets that
/// share an entry collapse into one slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Slot {
    Job(i64, JobKey),
    Highlight(i64),
    Replay(i64, String),
}

impl Slot {
    fn of(task: &Task) -> Slot {
        match task {
            Task::Job { key: JobKey::Highlight { highlight_file, .. }, .. }
            | Task::CustomHighlight { highlight_file } => Slot::Highlight(*highlight_file),
            Task::Job { changeset, key } => Slot::Job(*changeset, key.clone()),
            Task::Replay { repository, merge } => Slot::Replay(*repository, merge.clone()),
        }
    }
}

struct Coordinator {
    db: Connection,
    tasks: Sender<Task>,
    in_flight: HashSet<Slot>,
    /// In-flight task count per changeset.
    per_changeset: HashMap<i64, usize>,
    /// Changesets that had jobs left when last planned.
    tracked: HashSet<i64>,
    /// Custom highlights that failed; skipped by rescans until asked again.
    failed_custom: HashSet<i64>,
    active: Arc<Mutex<HashSet<i64>>>,
}

impl Coordinator {
    fn run(&mut self, control: Receiver<RunnerMessage>, done: Receiver<(Task, Outcome)>) {
        self.rescan();
        loop {
            select! {
                recv(control) -> message => match message {
                    Ok(RunnerMessage::Shutdown) | Err(_) => break,
                    Ok(message) => self.handle(message),
                },
                recv(done) -> finished => match finished {
                    Ok((task, outcome)) => self.complete(task, outcome),
                    Err(_) => {
                        error!("all workers exited");
                        break;
                    }
                },
            }
            self.publish();
        }
    }

    fn handle(&mut self, message: RunnerMessage) {
        debug!(?message, "runner message");
        match message {
            RunnerMessage::Wake(changeset) => self.schedule(changeset),
            RunnerMessage::Highlight(highlight_file) => {
                self.failed_custom.remove(&highlight_file);
                self.dispatch(Task::CustomHighlight { highlight_file });
            }
            RunnerMessage::Replays => self.schedule_replays(),
            RunnerMessage::Rescan => self.rescan(),
            RunnerMessage::Shutdown => {}
        }
    }

    fn rescan(&mut self) {
        match changesets::find_incomplete(&self.db) {
            Ok(ids) => ids.into_iter().for_each(|id| self.schedule(id)),
            Err(err) => warn!(error = %err, "could not list incomplete changesets"),
        }
        // Tracked changesets may be waiting on a job another changeset ran.
        let tracked: Vec<i64> = self.tracked.iter().copied().collect();
        tracked.into_iter().for_each(|id| self.schedule(id));
        self.schedule_replays();
        match highlights::pending_custom(&self.db) {
            Ok(ids) => {
                for highlight_file in ids {
                    if !self.failed_custom.contains(&highlight_file) {
                        self.dispatch(Task::CustomHighlight { highlight_file });
                    }
                }
            }
            Err(err) => warn!(error = %err, "could not list pending highlights"),
        }
        self.publish();
    }

    fn schedule_replays(&mut self) {
        match replays::pending(&self.db) {
            Ok(requests) => {
                for request in requests {
                    self.dispatch(Task::Replay { repository: request.repository, merge: request.merge });
                }
            }
            Err(err) => warn!(error = %err, "could not list pending replays"),
        }
    }

    fn schedule(&mut self, changeset: i64) {
        let plan = match plan::plan_changeset(&self.db, changeset) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(changeset, error = %err, "planning failed");
                self.tracked.remove(&changeset);
                return;
            }
        };
        let has_jobs = !plan.jobs.is_empty();
        for key in plan.jobs {
            self.dispatch(Task::Job { changeset, key });
        }
        if has_jobs || self.per_changeset.contains_key(&changeset) {
            self.tracked.insert(changeset);
        } else {
            self.tracked.remove(&changeset);
        }
    }

    /// Sends `task` to the pool unless an equivalent task is in flight.
    fn dispatch(&mut self, task: Task) {
        if !self.in_flight.insert(Slot::of(&task)) {
            return;
        }
        if let Task::Job { changeset, .. } = &task {
            *self.per_changeset.entry(*changeset).or_default() += 1;
        }
        if let Err(err) = self.tasks.send(task) {
            error!(error = %err, "no worker left to take the task");
            self.release(&err.into_inner());
        }
    }

    fn release(&mut self, task: &Task) {
        self.in_flight.remove(&Slot::of(task));
        if let Task::Job { changeset, .. } = task {
            if let Some(count) = self.per_changeset.get_mut(changeset) {
                *count -= 1;
                if *count == 0 {
                    self.per_changeset.remove(changeset);
                }
            }
        }
    }

    fn complete(&mut self, task: Task, outcome: Outcome) {
        self.release(&task);
        match task {
            Task::Job { changeset, key } => {
                self.schedule(changeset);
                if matches!(key, JobKey::Highlight { .. }) && outcome == Outcome::Done {
                    self.replan_tracked();
                }
            }
            Task::CustomHighlight { highlight_file } => match outcome {
                Outcome::Retry => self.dispatch(Task::CustomHighlight { highlight_file }),
                Outcome::Failed => {
                    self.failed_custom.insert(highlight_file);
                }
                Outcome::Done => self.replan_tracked(),
                Outcome::Skipped => {}
            },
            Task::Replay { repository, merge } => match outcome {
                Outcome::Retry => self.dispatch(Task::Replay { repository, merge }),
                // A successful replay leaves a new changeset to compute.
                Outcome::Done => self.rescan(),
                Outcome::Skipped | Outcome::Failed => {}
            },
        }
    }

    fn replan_tracked(&mut self) {
        let tracked: Vec<i64> = self.tracked.iter().copied().collect();
        tracked.into_iter().for_each(|id| self.schedule(id));
    }

    fn publish(&self) {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.clone_from(&self.tracked);
        active.extend(self.per_changeset.keys().copied());
    }
}

/// Totals of one [`process_inline`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InlineReport {
    /// Changeset jobs run, highlighting excluded.
    pub jobs: usize,
    pub failed: usize,
    pub replays: usize,
    /// Highlight entries computed, for changesets or ad-hoc requests.
    pub highlights: usize,
}

/// Runs the plan and execute loop on the calling thread until nothing is
/// left to do for `changesets`, pending replays and custom highlights.
pub fn process_inline(
    db_path: &str,
    config: &EngineConfig,
    changesets: &[i64],
) -> Result<InlineReport, ComputeError> {
    let mut worker = Worker::open(db_path, config.clone())?;
    let mut report = InlineReport::default();
    let mut failed_custom: HashSet<i64> = HashSet::new();

    loop {
        let mut progressed = false;
        for &changeset in changesets {
            let plan = plan::plan_changeset(worker.connection(), changeset)?;
            for key in plan.jobs {
                let highlighting = matches!(key, JobKey::Highlight { .. });
                match worker.run(&Task::Job { changeset, key }) {
                    Outcome::Done if highlighting => report.highlights += 1,
                    Outcome::Done => report.jobs += 1,
                    Outcome::Failed => report.failed += 1,
                    Outcome::Skipped | Outcome::Retry => continue,
                }
                progressed = true;
            }
        }

        for request in replays::pending(worker.connection())? {
            let task = Task::Replay { repository: request.repository, merge: request.merge };
            if worker.run(&task) == Outcome::Done {
                report.replays += 1;
                progressed = true;
            }
        }

        for highlight_file in highlights::pending_custom(worker.connection())? {
            if failed_custom.contains(&highlight_file) {
                continue;
            }
            match worker.run(&Task::CustomHighlight { highlight_file }) {
                Outcome::Done => {
                    report.highlights += 1;
                    progressed = true;
                }
                Outcome::Failed => {
                    failed_custom.insert(highlight_file);
                    report.failed += 1;
                }
                Outcome::Skipped | Outcome::Retry => {}
            }
        }

        if !progressed {
            break;
        }
    }
    debug!(?report, "inline processing finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::testing::TestRepo;
    use diffcache_core::types::{HighlightState, ReplayState};
    use diffcache_core::{content, highlight as store_highlight, repositories};

    fn setup(repo: &TestRepo) -> (tempfile::TempDir, String, i64) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("cache.db").to_string_lossy().into_owned();
        let conn = open_sync(&path).unwrap();
        let repository = repositories::register(&conn, "test", repo.path()).unwrap().id;
        (dir, path, repository)
    }

    fn two_commits(repo: &TestRepo) -> (String, String) {
        let old = "def run(limit):\n    total = 0\n    return total\n";
        let new = "def run(limit):\n    total = limit\n    return total\n";
        let from = repo.commit(&[("main.py", old), ("README", "text\n")], &[]);
        let to = repo.commit(&[("main.py", new), ("README", "text\n")], &[&from]);
        (from, to)
    }

    #[test]
    fn inline_processing_completes_content_and_highlights() {
        let repo = TestRepo::new();
        let (from, to) = two_commits(&repo);
        let (_dir, path, repository) = setup(&repo);
        let mut conn = open_sync(&path).unwrap();
        let cs = changesets::get_or_create(&mut conn, repository, &to, Some(&from), None, false).unwrap();

        let report = process_inline(&path, &EngineConfig::default(), &[cs.id]).unwrap();
        assert_eq!(report.failed, 0);
        assert!(changesets::fetch(&conn, cs.id).unwrap().unwrap().complete);
        assert!(content::fetch(&conn, cs.id).unwrap().is_none(), "content was never requested");

        content::request(&conn, cs.id, 10).unwrap();
        store_highlight::request_changeset(&conn, cs.id, true).unwrap();
        let report = process_inline(&path, &EngineConfig::default(), &[cs.id]).unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.highlights, 2);
        assert!(content::fetch(&conn, cs.id).unwrap().unwrap().complete);

        let differences = content::file_differences(&conn, cs.id).unwrap();
        assert_eq!(differences.len(), 1);
        let difference = &differences[0];
        assert_eq!(difference.path, "main.py");
        let blocks = content::changed_lines(&conn, cs.id, difference.file).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].offset, 1);
        assert!(blocks[0].analysis.is_some());

        let side = difference.new.unwrap();
        let entry = store_highlight::fetch(&conn, side.highlight_file.unwrap()).unwrap().unwrap();
        assert_eq!(entry.state, HighlightState::Highlighted);
        assert_eq!(store_highlight::lines(&conn, entry.id).unwrap().len(), 3);
    }

    #[test]
    fn changesets_over_the_same_blob_share_one_highlight() {
        let repo = TestRepo::new();
        let shared = repo.commit(&[("x.py", "a = 1\n")], &[]);
        let other = repo.commit(&[("x.py", "a = 3\n")], &[]);
        let head = repo.commit(&[("x.py", "a = 2\n")], &[&shared]);
        let (_dir, path, repository) = setup(&repo);
        let mut conn = open_sync(&path).unwrap();
        let first = changesets::get_or_create(&mut conn, repository, &head, Some(&shared), None, false).unwrap();
        let second = changesets::get_or_create(&mut conn, repository, &head, Some(&other), None, false).unwrap();
        for id in [first.id, second.id] {
            content::request(&conn, id, 10).unwrap();
            store_highlight::request_changeset(&conn, id, true).unwrap();
        }

        let report = process_inline(&path, &EngineConfig::default(), &[first.id, second.id]).unwrap();
        assert_eq!(report.failed, 0);
        // Two distinct old sides plus one shared new side.
        assert_eq!(report.highlights, 3);

        let new_sides: Vec<i64> = [first.id, second.id]
            .into_iter()
            .map(|id| content::file_differences(&conn, id).unwrap()[0].new.unwrap().highlight_file.unwrap())
            .collect();
        assert_eq!(new_sides[0], new_sides[1]);
        let entry = store_highlight::fetch(&conn, new_sides[0]).unwrap().unwrap();
        assert_eq!(entry.state, HighlightState::Highlighted);
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM highlightfiles WHERE sha1 = ?1", [&entry.sha1], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn runner_processes_woken_changesets_and_replays() {
        let repo = TestRepo::new();
        let (from, to) = two_commits(&repo);
        let base = repo.commit(&[("a.txt", "a\n")], &[]);
        let left = repo.commit(&[("a.txt", "left\n")], &[&base]);
        let right = repo.commit(&[("a.txt", "a\n"), ("b.txt", "b\n")], &[&base]);
        let merge = repo.commit(&[("a.txt", "left\n"), ("b.txt", "b\n")], &[&left, &right]);
        let (_dir, path, repository) = setup(&repo);
        let mut conn = open_sync(&path).unwrap();
        let cs = changesets::get_or_create(&mut conn, repository, &to, Some(&from), None, false).unwrap();
        content::request(&conn, cs.id, 10).unwrap();

        let config = EngineConfig { workers: 2, ..EngineConfig::default() };
        let runner = start(&path, config).unwrap();
        let handle = runner.handle();
        replays::request(&mut conn, repository, &merge, None, false).unwrap();
        handle.replays();
        handle.wake(cs.id);

        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        loop {
            let content_done = content::fetch(&conn, cs.id).unwrap().is_some_and(|c| c.complete);
            let replay_done = replays::fetch(&conn, repository, &merge)
                .unwrap()
                .is_some_and(|r| r.state != ReplayState::Pending);
            if content_done && replay_done {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "runner did not finish");
            thread::sleep(Duration::from_millis(20));
        }
        runner.shutdown();

        let stored = replays::fetch(&conn, repository, &merge).unwrap().unwrap();
        assert!(matches!(stored.state, ReplayState::Replayed(_)), "{:?}", stored.state);
    }
}
