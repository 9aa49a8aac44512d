//! Works out which jobs a changeset still needs.

use std::collections::HashSet;

use diffcache_core::{changesets, content, highlight, journal, JobKey, StoreError};
use rusqlite::Connection;
use tracing::{debug, info};

/// Outstanding work of one changeset.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ChangesetPlan {
    /// Jobs that can run now, in stage order.
    pub jobs: Vec<JobKey>,
    /// The content difference became complete while planning.
    pub content_completed: bool,
}

/// Plans changeset `id`, skipping journaled jobs.
///
/// Content jobs are only planned once the structure difference is complete,
/// and only when a content difference was requested. When no examine,
/// compare or analyze job remains, the content difference is marked complete
/// here; failed jobs count as done for that purpose. Highlight jobs are only
/// planned for changesets with highlighting requested.
pub fn plan_changeset(db: &Connection, id: i64) -> Result<ChangesetPlan, StoreError> {
    let changeset = changesets::fetch(db, id)?
        .ok_or_else(|| StoreError::NotFound(format!("changeset {id}")))?;
    let failed: HashSet<JobKey> = journal::failed_keys(db, id)?.into_iter().collect();
    let mut plan = ChangesetPlan::default();

    if !changeset.complete {
        if !failed.contains(&JobKey::Structure) {
            plan.jobs.push(JobKey::Structure);
        }
        return Ok(plan);
    }
    let Some(difference) = content::fetch(db, id)? else {
        return Ok(plan);
    };

    let mut jobs: Vec<JobKey> = Vec::new();
    jobs.extend(content::unexamined_files(db, id)?.into_iter().map(|f| JobKey::Examine { file: f.file }));
    jobs.extend(content::pending_comparisons(db, id)?.into_iter().map(|file| JobKey::Compare { file }));
    jobs.extend(
        content::unanalyzed_blocks(db, id)?
            .into_iter()
            .map(|(file, block)| JobKey::Analyze { file, block }),
    );
    jobs.retain(|key| !failed.contains(key));
    // Failed examine jobs count as examined; their files get no entries.
    let all_examined = !jobs.iter().any(|key| matches!(key, JobKey::Examine { .. }));

    if jobs.is_empty() && !difference.complete {
        content::set_complete(db, id)?;
        plan.content_completed = true;
        info!(changeset = id, "content difference complete");
    }

    if let Some(request) = highlight::changeset_request(db, id)?.filter(|r| r.requested) {
        jobs.extend(
            content::requested_highlights(db, id)?
                .into_iter()
                .map(|(highlight_file, sha1)| JobKey::Highlight { highlight_file, sha1 })
                .filter(|key| !failed.contains(key)),
        );
        if all_examined && !request.evaluated {
            highlight::set_evaluated(db, id)?;
            debug!(changeset = id, "highlighting evaluated");
        }
    }
    plan.jobs = jobs;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use diffcache_core::changesets::NewChangedFile;
    use diffcache_core::types::{ChangedLineBlock, FileDifference, FileSide, HighlightKey};
    use diffcache_core::{db, repositories};

    const TO: &str = "1111111111111111111111111111111111111111";
    const FROM: &str = "2222222222222222222222222222222222222222";

    #[test]
    fn stages_are_planned_in_order_and_journal_suppresses() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut conn = db::open_sync(dir.path().join("cache.db")).unwrap();
        let repository = repositories::register(&conn, "demo", "/tmp/demo").unwrap().id;
        let cs = changesets::get_or_create(&mut conn, repository, TO, Some(FROM), None, false).unwrap();

        assert_eq!(plan_changeset(&conn, cs.id).unwrap().jobs, [JobKey::Structure]);
        journal::record(&conn, cs.id, &JobKey::Structure, true, "boom").unwrap();
        assert!(plan_changeset(&conn, cs.id).unwrap().jobs.is_empty());
        journal::clear(&conn, cs.id, None).unwrap();

        changesets::insert_files(
            &mut conn,
            cs.id,
            &[NewChangedFile {
                path: "a.txt".into(),
                old_sha1: Some(FROM.into()),
                old_mode: Some(0o100644),
                new_sha1: Some(TO.into()),
                new_mode: Some(0o100644),
            }],
        )
        .unwrap();
        changesets::set_complete(&conn, cs.id).unwrap();
        assert!(plan_changeset(&conn, cs.id).unwrap().jobs.is_empty(), "no content requested");

        content::request(&conn, cs.id, 1).unwrap();
        highlight::request_changeset(&conn, cs.id, true).unwrap();
        let file = changesets::structure_diff(&conn, cs.id).unwrap()[0].file;
        let plan = plan_changeset(&conn, cs.id).unwrap();
        assert_eq!(plan.jobs, [JobKey::Examine { file }]);
        assert!(!plan.content_completed);

        journal::record(&conn, cs.id, &JobKey::Examine { file }, true, "unreadable").unwrap();
        let plan = plan_changeset(&conn, cs.id).unwrap();
        assert!(plan.jobs.is_empty());
        assert!(plan.content_completed, "failed jobs do not hold completion back");
        assert!(content::fetch(&conn, cs.id).unwrap().unwrap().complete);
        assert!(highlight::changeset_request(&conn, cs.id).unwrap().unwrap().evaluated);
    }

    #[test]
    fn highlight_jobs_wait_for_a_highlight_request() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut conn = db::open_sync(dir.path().join("cache.db")).unwrap();
        let repository = repositories::register(&conn, "demo", "/tmp/demo").unwrap().id;
        let cs = changesets::get_or_create(&mut conn, repository, TO, Some(FROM), None, false).unwrap();
        changesets::insert_files(
            &mut conn,
            cs.id,
            &[NewChangedFile {
                path: "new.py".into(),
                old_sha1: None,
                old_mode: None,
                new_sha1: Some(TO.into()),
                new_mode: Some(0o100644),
            }],
        )
        .unwrap();
        changesets::set_complete(&conn, cs.id).unwrap();
        content::request(&conn, cs.id, 1).unwrap();

        let file = changesets::structure_diff(&conn, cs.id).unwrap()[0].file;
        let side = FileSide { is_binary: false, length: 2, linebreak: true, highlight_file: None };
        let difference = FileDifference {
            changeset: cs.id,
            file,
            path: "new.py".into(),
            comparison_pending: false,
            old: None,
            new: Some(side),
        };
        let key = HighlightKey { sha1: TO.into(), language: Some("Python".into()), conflicts: false };
        let whole = ChangedLineBlock {
            index: 0,
            offset: 0,
            delete_count: 0,
            delete_length: 0,
            insert_count: 2,
            insert_length: 2,
            analysis: Some(String::new()),
        };
        content::insert_file_difference(&mut conn, repository, &difference, [None, Some(&key)], &[whole]).unwrap();

        let plan = plan_changeset(&conn, cs.id).unwrap();
        assert!(plan.content_completed);
        assert!(plan.jobs.is_empty(), "highlighting was never asked for");

        highlight::request_changeset(&conn, cs.id, false).unwrap();
        assert!(plan_changeset(&conn, cs.id).unwrap().jobs.is_empty());

        highlight::request_changeset(&conn, cs.id, true).unwrap();
        let plan = plan_changeset(&conn, cs.id).unwrap();
        assert_eq!(plan.jobs.len(), 1);
        assert!(matches!(&plan.jobs[0], JobKey::Highlight { sha1, .. } if sha1 == TO));
        assert!(highlight::changeset_request(&conn, cs.id).unwrap().unwrap().evaluated);
    }
}
