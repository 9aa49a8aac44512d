//! Integration tests for the store lifecycle.
//!
//! Exercises: open_db, open_sync, migrate, the changeset registry under
//! concurrent creation, content-diff bookkeeping, highlight and replay state
//! constraints, the error journal and garbage collection.

use diffcache_core::changesets::{self, NewChangedFile};
use diffcache_core::types::{
    ChangedLineBlock, FileDifference, FileSide, HighlightKey, HighlightState, ReplayState,
};
use diffcache_core::{
    content, db, gc, highlight, journal, replay, repositories, JobKey, Store, StoreError,
};

const TO: &str = "1111111111111111111111111111111111111111";
const FROM: &str = "2222222222222222222222222222222222222222";
const BLOB: &str = "3333333333333333333333333333333333333333";

fn temp_db_path() -> String {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.keep().join("test.db");
    path.to_string_lossy().to_string()
}

fn block(index: i64, offset: i64, delete: i64, insert: i64) -> ChangedLineBlock {
    ChangedLineBlock {
        index,
        offset,
        delete_count: delete,
        delete_length: delete,
        insert_count: insert,
        insert_length: insert,
        analysis: None,
    }
}

#[tokio::test]
async fn schema_and_persistence() {
    let path = temp_db_path();
    let conn = db::open_db(&path).await.unwrap();

    let version: i64 = conn
        .call(|db| {
            Ok::<_, rusqlite::Error>(db.query_row(
                "SELECT MAX(version) FROM schema_version",
                [],
                |r| r.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(version, 2, "schema_version should be 2");

    let journal_mode: String = conn
        .call(|db| {
            Ok::<_, rusqlite::Error>(
                db.query_row("PRAGMA journal_mode", [], |r| r.get(0))?,
            )
        })
        .await
        .unwrap();
    assert_eq!(journal_mode, "wal", "journal_mode should be wal");

    let error_pk: i64 = conn
        .call(|db| {
            Ok::<_, rusqlite::Error>(db.query_row(
                "SELECT COUNT(*) FROM pragma_table_info('changeseterrors') WHERE pk > 0",
                [],
                |r| r.get(0),
            )?)
        })
        .await
        .unwrap();
    assert_eq!(error_pk, 5, "job key is stored as typed primary-key columns");

    let store = Store::open(&path).await.unwrap();
    let repo = store.call(|db| repositories::register(db, "demo", "/tmp/demo")).await.unwrap();
    let cs = store
        .call(move |db| changesets::get_or_create(db, repo.id, TO, Some(FROM), None, false))
        .await
        .unwrap();
    assert!(!cs.processed && !cs.complete);

    // A second, blocking connection sees the same row.
    let sync = db::open_sync(&path).unwrap();
    let found = changesets::find(&sync, repo.id, TO, Some(FROM), None).unwrap().unwrap();
    assert_eq!(found.id, cs.id);
    assert_eq!(found.from_commit.as_deref(), Some(FROM));
}

#[tokio::test]
async fn concurrent_creation_converges_on_one_changeset() {
    let path = temp_db_path();
    let store = Store::open(&path).await.unwrap();
    let repo = store.call(|db| repositories::register(db, "demo", "/tmp/demo")).await.unwrap();

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let mut db = db::open_sync(&path).unwrap();
                changesets::get_or_create(&mut db, repo.id, TO, Some(FROM), None, false)
                    .unwrap()
                    .id
            })
        })
        .collect();
    let mut ids: Vec<i64> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    let from_async = futures::future::join_all((0..4).map(|_| {
        let store = store.clone();
        async move {
            store
                .call(move |db| changesets::get_or_create(db, repo.id, TO, Some(FROM), None, false))
                .await
                .unwrap()
                .id
        }
    }))
    .await;
    ids.extend(from_async);
    ids.dedup();
    assert_eq!(ids.len(), 1, "every caller should read back the same id");

    // A root-commit changeset and a merge-scoped one are distinct identities.
    let root = store
        .call(move |db| changesets::get_or_create(db, repo.id, TO, None, None, false))
        .await
        .unwrap();
    let scoped = store
        .call(move |db| changesets::get_or_create(db, repo.id, TO, Some(FROM), Some(TO), false))
        .await
        .unwrap();
    assert_ne!(root.id, ids[0]);
    assert_ne!(scoped.id, ids[0]);
    assert_eq!(scoped.for_merge.as_deref(), Some(TO));

    let count: i64 = store
        .call(|db| db.query_row("SELECT COUNT(*) FROM changesets", [], |r| r.get(0)))
        .await
        .unwrap();
    assert_eq!(count, 3);
}

#[test]
fn content_request_is_idempotent_and_comparison_is_claimed_once() {
    let path = temp_db_path();
    let mut db = db::open_sync(&path).unwrap();
    let repo = repositories::register(&db, "demo", "/tmp/demo").unwrap();
    let cs = changesets::get_or_create(&mut db, repo.id, TO, Some(FROM), None, false).unwrap();
    changesets::insert_files(
        &mut db,
        cs.id,
        &[NewChangedFile {
            path: "bar.py".into(),
            old_sha1: Some(FROM.into()),
            old_mode: Some(0o100644),
            new_sha1: Some(BLOB.into()),
            new_mode: Some(0o100644),
        }],
    )
    .unwrap();
    changesets::set_complete(&db, cs.id).unwrap();

    let (first, created) = content::request(&db, cs.id, 100).unwrap();
    assert!(created);
    let (second, created) = content::request(&db, cs.id, 50).unwrap();
    assert!(!created);
    assert_eq!(second.requested, 100, "requested never moves backwards");
    assert_eq!(first.changeset, second.changeset);

    let file = content::unexamined_files(&db, cs.id).unwrap().remove(0);
    let side = FileSide { is_binary: false, length: 20, linebreak: true, highlight_file: None };
    let difference = FileDifference {
        changeset: cs.id,
        file: file.file,
        path: file.path.clone(),
        comparison_pending: true,
        old: Some(side),
        new: Some(side),
    };
    let old_key = HighlightKey { sha1: FROM.into(), language: Some("Python".into()), conflicts: false };
    let new_key = HighlightKey { sha1: BLOB.into(), ..old_key.clone() };
    let keys = [Some(&old_key), Some(&new_key)];
    assert!(content::insert_file_difference(&mut db, repo.id, &difference, keys, &[]).unwrap());
    assert!(!content::insert_file_difference(&mut db, repo.id, &difference, keys, &[]).unwrap());
    assert!(content::unexamined_files(&db, cs.id).unwrap().is_empty());

    let stored = content::file_difference(&db, cs.id, file.file).unwrap().unwrap();
    let old_hl = stored.old.and_then(|s| s.highlight_file).expect("old side highlight");
    let new_hl = stored.new.and_then(|s| s.highlight_file).expect("new side highlight");
    assert_ne!(old_hl, new_hl);
    let requested: Vec<i64> =
        content::requested_highlights(&db, cs.id).unwrap().into_iter().map(|(id, _)| id).collect();
    assert_eq!(requested.len(), 2);
    assert!(requested.contains(&old_hl) && requested.contains(&new_hl));
    assert_eq!(content::pending_comparisons(&db, cs.id).unwrap(), vec![file.file]);

    let blocks = [block(0, 9, 3, 3)];
    assert!(content::store_comparison(&mut db, cs.id, file.file, &blocks).unwrap());
    assert!(
        !content::store_comparison(&mut db, cs.id, file.file, &blocks).unwrap(),
        "a second writer must not insert blocks again"
    );
    assert_eq!(content::changed_lines(&db, cs.id, file.file).unwrap().len(), 1);
    assert_eq!(content::unanalyzed_blocks(&db, cs.id).unwrap(), vec![(file.file, 0)]);

    content::set_analysis(&db, cs.id, file.file, 0, "0=0:ws").unwrap();
    assert!(content::unanalyzed_blocks(&db, cs.id).unwrap().is_empty());
}

#[test]
fn highlight_flags_are_never_both_set() {
    let path = temp_db_path();
    let mut db = db::open_sync(&path).unwrap();
    let repo = repositories::register(&db, "demo", "/tmp/demo").unwrap();

    let a = highlight::request(&mut db, repo.id, BLOB, Some("Python"), false).unwrap();
    let b = highlight::request(&mut db, repo.id, BLOB, Some("Python"), false).unwrap();
    assert_eq!(a.id, b.id, "same four-tuple shares one entry");
    assert_eq!(a.state, HighlightState::Requested);
    let conflicted = highlight::request(&mut db, repo.id, BLOB, Some("Python"), true).unwrap();
    assert_ne!(conflicted.id, a.id);

    let both = db.execute("UPDATE highlightfiles SET highlighted = 1 WHERE id = ?1", [a.id]);
    assert!(both.is_err(), "CHECK must reject requested AND highlighted");

    let lines = vec!["[{\"text\":\"x = 1\"}]".to_string()];
    assert!(highlight::store_lines(&mut db, a.id, "Python", &lines, &[]).unwrap());
    assert!(!highlight::store_lines(&mut db, a.id, "Python", &lines, &[]).unwrap());
    let stored = highlight::fetch(&db, a.id).unwrap().unwrap();
    assert_eq!(stored.state, HighlightState::Highlighted);
    assert_eq!(highlight::lines(&db, a.id).unwrap()[0][0].text, "x = 1");

    // Asking again for a highlighted entry leaves it highlighted.
    let again = highlight::request(&mut db, repo.id, BLOB, Some("Python"), false).unwrap();
    assert_eq!(again.state, HighlightState::Highlighted);

    // An idle entry is re-requested.
    highlight::drop_request(&db, conflicted.id).unwrap();
    assert_eq!(highlight::fetch(&db, conflicted.id).unwrap().unwrap().state, HighlightState::Idle);
    let revived = highlight::request(&mut db, repo.id, BLOB, Some("Python"), true).unwrap();
    assert_eq!(revived.state, HighlightState::Requested);
}

#[test]
fn replay_outcomes_are_exclusive_and_terminal() {
    let path = temp_db_path();
    let mut db = db::open_sync(&path).unwrap();
    let repo = repositories::register(&db, "demo", "/tmp/demo").unwrap();

    let pending = replay::request(&mut db, repo.id, TO, None, false).unwrap();
    assert_eq!(pending.state, ReplayState::Pending);
    assert!(replay::store_failure(&db, repo.id, TO, "conflict in tree").unwrap());
    assert!(!replay::store_success(&mut db, repo.id, TO, FROM).unwrap());
    assert_eq!(
        replay::fetch(&db, repo.id, TO).unwrap().unwrap().state,
        ReplayState::Failed("conflict in tree".into())
    );

    // Without retry the failure sticks; with retry it is cleared.
    let unchanged = replay::request(&mut db, repo.id, TO, None, false).unwrap();
    assert!(matches!(unchanged.state, ReplayState::Failed(_)));
    let retried = replay::request(&mut db, repo.id, TO, None, true).unwrap();
    assert_eq!(retried.state, ReplayState::Pending);
    assert_eq!(replay::pending(&db).unwrap().len(), 1);

    assert!(replay::store_success(&mut db, repo.id, TO, FROM).unwrap());
    assert!(!replay::store_failure(&db, repo.id, TO, "late").unwrap());
    assert_eq!(
        replay::fetch(&db, repo.id, TO).unwrap().unwrap().state,
        ReplayState::Replayed(FROM.into())
    );

    let both = db.execute("UPDATE mergereplayrequests SET traceback = 'x'", []);
    assert!(both.is_err(), "CHECK must reject replay AND traceback");
}

#[test]
fn replay_onto_changes_only_on_retried_failure() {
    let path = temp_db_path();
    let mut db = db::open_sync(&path).unwrap();
    let repo = repositories::register(&db, "demo", "/tmp/demo").unwrap();

    let merge = replay::request(&mut db, repo.id, TO, None, false).unwrap();
    assert_eq!(merge.onto, None);
    let err = replay::request(&mut db, repo.id, TO, Some(FROM), false).unwrap_err();
    assert!(matches!(err, StoreError::InvalidInput(_)), "{err}");
    let err = replay::request(&mut db, repo.id, TO, Some(FROM), true).unwrap_err();
    assert!(matches!(err, StoreError::InvalidInput(_)), "a pending request keeps its base");
    assert_eq!(replay::fetch(&db, repo.id, TO).unwrap().unwrap().onto, None);

    assert!(replay::store_failure(&db, repo.id, TO, "not a merge").unwrap());
    let rebased = replay::request(&mut db, repo.id, TO, Some(FROM), true).unwrap();
    assert_eq!(rebased.onto.as_deref(), Some(FROM));
    assert_eq!(rebased.state, ReplayState::Pending);

    let same = replay::request(&mut db, repo.id, TO, Some(FROM), false).unwrap();
    assert_eq!(same, rebased);
}

#[test]
fn file_differences_need_a_live_content_anchor() {
    let path = temp_db_path();
    let mut db = db::open_sync(&path).unwrap();
    let repo = repositories::register(&db, "demo", "/tmp/demo").unwrap();
    let cs = changesets::get_or_create(&mut db, repo.id, TO, Some(FROM), None, false).unwrap();
    changesets::insert_files(
        &mut db,
        cs.id,
        &[NewChangedFile {
            path: "gone.py".into(),
            old_sha1: Some(FROM.into()),
            old_mode: Some(0o100644),
            new_sha1: Some(BLOB.into()),
            new_mode: Some(0o100644),
        }],
    )
    .unwrap();
    changesets::set_complete(&db, cs.id).unwrap();
    let file = changesets::structure_diff(&db, cs.id).unwrap()[0].file;

    let side = FileSide { is_binary: false, length: 3, linebreak: true, highlight_file: None };
    let difference = FileDifference {
        changeset: cs.id,
        file,
        path: "gone.py".into(),
        comparison_pending: true,
        old: Some(side),
        new: Some(side),
    };
    let key = HighlightKey { sha1: BLOB.into(), language: Some("Python".into()), conflicts: false };
    let inserted =
        content::insert_file_difference(&mut db, repo.id, &difference, [None, Some(&key)], &[]).unwrap();
    assert!(!inserted, "nothing is written without an anchor");
    assert!(highlight::find(&db, repo.id, BLOB, Some("Python"), false).unwrap().is_none());
    assert!(!content::store_comparison(&mut db, cs.id, file, &[block(0, 0, 1, 1)]).unwrap());

    content::request(&db, cs.id, 1).unwrap();
    assert!(content::insert_file_difference(&mut db, repo.id, &difference, [None, Some(&key)], &[]).unwrap());
}

#[test]
fn changeset_highlight_requests_are_sticky() {
    let path = temp_db_path();
    let mut db = db::open_sync(&path).unwrap();
    let repo = repositories::register(&db, "demo", "/tmp/demo").unwrap();
    let cs = changesets::get_or_create(&mut db, repo.id, TO, Some(FROM), None, false).unwrap();
    changesets::set_complete(&db, cs.id).unwrap();
    content::request(&db, cs.id, 1).unwrap();
    content::set_complete(&db, cs.id).unwrap();
    assert!(highlight::changeset_request(&db, cs.id).unwrap().is_none());

    let off = highlight::request_changeset(&db, cs.id, false).unwrap();
    assert!(!off.requested && !off.evaluated);
    highlight::set_evaluated(&db, cs.id).unwrap();
    assert!(!highlight::changeset_request(&db, cs.id).unwrap().unwrap().evaluated);
    assert!(changesets::find_incomplete(&db).unwrap().is_empty());

    let on = highlight::request_changeset(&db, cs.id, true).unwrap();
    assert!(on.requested && !on.evaluated);
    assert_eq!(changesets::find_incomplete(&db).unwrap(), [cs.id]);

    highlight::set_evaluated(&db, cs.id).unwrap();
    let again = highlight::request_changeset(&db, cs.id, false).unwrap();
    assert!(again.requested && again.evaluated, "a later default does not withdraw a request");
    assert!(changesets::find_incomplete(&db).unwrap().is_empty());
}

#[test]
fn journal_replaces_and_clears() {
    let path = temp_db_path();
    let mut db = db::open_sync(&path).unwrap();
    let repo = repositories::register(&db, "demo", "/tmp/demo").unwrap();
    let cs = changesets::get_or_create(&mut db, repo.id, TO, Some(FROM), None, false).unwrap();

    let compare = JobKey::Compare { file: 4 };
    let analyze = JobKey::Analyze { file: 4, block: 2 };
    journal::record(&db, cs.id, &compare, false, "first").unwrap();
    journal::record(&db, cs.id, &compare, true, "second").unwrap();
    journal::record(&db, cs.id, &analyze, false, "tokenizer").unwrap();

    let errors = journal::errors(&db, cs.id).unwrap();
    assert_eq!(errors.len(), 2, "recording the same key replaces the row");
    let compare_error = errors.iter().find(|e| e.key == compare).unwrap();
    assert!(compare_error.fatal);
    assert_eq!(compare_error.traceback, "second");
    assert!(journal::has_fatal(&db, cs.id).unwrap());

    assert!(journal::is_suppressed(&db, cs.id, &analyze).unwrap());
    assert!(!journal::is_suppressed(&db, cs.id, &JobKey::Examine { file: 4 }).unwrap());

    assert_eq!(journal::clear(&db, cs.id, Some(&compare)).unwrap(), 1);
    assert!(!journal::has_fatal(&db, cs.id).unwrap());
    assert_eq!(journal::clear(&db, cs.id, None).unwrap(), 1);
    assert!(journal::failed_keys(&db, cs.id).unwrap().is_empty());
}

#[test]
fn gc_cascades_stale_content_but_keeps_custom_highlights() {
    let path = temp_db_path();
    let mut db = db::open_sync(&path).unwrap();
    let repo = repositories::register(&db, "demo", "/tmp/demo").unwrap();
    let cs = changesets::get_or_create(&mut db, repo.id, TO, Some(FROM), None, false).unwrap();
    changesets::insert_files(
        &mut db,
        cs.id,
        &[
            NewChangedFile {
                path: "kept.rs".into(),
                old_sha1: None,
                old_mode: None,
                new_sha1: Some(BLOB.into()),
                new_mode: Some(0o100644),
            },
            NewChangedFile {
                path: "dropped.rs".into(),
                old_sha1: None,
                old_mode: None,
                new_sha1: Some(FROM.into()),
                new_mode: Some(0o100644),
            },
        ],
    )
    .unwrap();
    changesets::set_complete(&db, cs.id).unwrap();
    content::request(&db, cs.id, 1_000).unwrap();

    let kept = highlight::request(&mut db, repo.id, BLOB, Some("Rust"), false).unwrap();
    let dropped = highlight::request(&mut db, repo.id, FROM, Some("Rust"), false).unwrap();
    let contexts = [diffcache_core::types::CodeContext {
        first_line: 0,
        last_line: 3,
        context: "fn main()".into(),
    }];
    highlight::store_lines(&mut db, dropped.id, "Rust", &["[]".into()], &contexts).unwrap();
    let custom = highlight::create_custom(&db, kept.id, 1_000).unwrap();
    uuid_shaped(&custom.id);

    for file in content::unexamined_files(&db, cs.id).unwrap() {
        let hl = if file.path == "kept.rs" { kept.id } else { dropped.id };
        let difference = FileDifference {
            changeset: cs.id,
            file: file.file,
            path: file.path,
            comparison_pending: false,
            old: None,
            new: Some(FileSide { is_binary: false, length: 5, linebreak: true, highlight_file: Some(hl) }),
        };
        let whole = ChangedLineBlock { analysis: Some(String::new()), ..block(0, 0, 0, 5) };
        content::insert_file_difference(&mut db, repo.id, &difference, [None, None], &[whole]).unwrap();
    }

    let policy = gc::GcPolicy { content_retention_secs: 100, custom_highlight_retention_secs: 10_000 };

    // Still fresh, or active in the runner: nothing goes.
    let report = gc::sweep(&mut db, &policy, 1_050, &[]).unwrap();
    assert_eq!(report, gc::GcReport::default());
    let report = gc::sweep(&mut db, &policy, 5_000, &[cs.id]).unwrap();
    assert_eq!(report.content_differences, 0);

    let report = gc::sweep(&mut db, &policy, 5_000, &[]).unwrap();
    assert_eq!(report.content_differences, 1);
    assert_eq!(report.highlight_files, 1);
    assert_eq!(report.code_contexts, 1);
    assert!(content::fetch(&db, cs.id).unwrap().is_none());
    assert!(content::file_differences(&db, cs.id).unwrap().is_empty());
    let lines: i64 = db
        .query_row("SELECT COUNT(*) FROM changesetchangedlines", [], |r| r.get(0))
        .unwrap();
    assert_eq!(lines, 0, "changed lines cascade with their content diff");

    assert!(highlight::fetch(&db, kept.id).unwrap().is_some(), "custom request keeps entry alive");
    assert!(highlight::fetch(&db, dropped.id).unwrap().is_none());
    assert!(changesets::fetch(&db, cs.id).unwrap().is_some(), "structure diff is not collected");

    // Once the custom request expires the entry goes too.
    let report = gc::sweep(&mut db, &policy, 20_000, &[]).unwrap();
    assert_eq!(report.custom_highlight_requests, 1);
    assert_eq!(report.highlight_files, 1);
    assert!(highlight::touch_custom(&db, &custom.id, 20_001).unwrap().is_none());
}

fn uuid_shaped(id: &str) {
    assert_eq!(id.len(), 36);
    assert_eq!(id.matches('-').count(), 4);
}
