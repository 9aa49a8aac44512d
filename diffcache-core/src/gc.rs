//! Garbage collection of cached content diffs and highlights.

use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;

/// Retention windows, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcPolicy {
    pub content_retention_secs: i64,
    pub custom_highlight_retention_secs: i64,
}

impl Default for GcPolicy {
    fn default() -> Self {
        GcPolicy {
            content_retention_secs: 7 * 24 * 60 * 60,
            custom_highlight_retention_secs: 24 * 60 * 60,
        }
    }
}

/// Row counts removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub content_differences: usize,
    pub custom_highlight_requests: usize,
    pub highlight_files: usize,
    pub code_contexts: usize,
}

/// Runs one sweep at time `now`.
///
/// Content diffs of changesets listed in `active` are kept regardless of
/// age. File differences and changed lines go with their content diff by
/// cascade, which is what makes the following highlight pass see them as
/// unreferenced.
///
/// # Errors
///
/// Returns `rusqlite::Error` if the transaction fails; the sweep is then
/// rolled back as a whole.
pub fn sweep(
    db: &mut Connection,
    policy: &GcPolicy,
    now: i64,
    active: &[i64],
) -> rusqlite::Result<GcReport> {
    let tx = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut report = GcReport::default();

    let content_cutoff = now - policy.content_retention_secs;
    {
        let mut stale = tx.prepare(
            "SELECT changeset FROM changesetcontentdifferences WHERE requested < ?1",
        )?;
        let candidates = stale
            .query_map(params![content_cutoff], |r| r.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let mut delete =
            tx.prepare("DELETE FROM changesetcontentdifferences WHERE changeset = ?1")?;
        for changeset in candidates.into_iter().filter(|id| !active.contains(id)) {
            report.content_differences += delete.execute(params![changeset])?;
        }
    }

    report.custom_highlight_requests = tx.execute(
        "DELETE FROM customhighlightrequests WHERE last_access < ?1",
        params![now - policy.custom_highlight_retention_secs],
    )?;

    report.highlight_files = tx.execute(
        "DELETE FROM highlightfiles
          WHERE id NOT IN (SELECT old_highlightfile FROM changesetfiledifferences
                            WHERE old_highlightfile IS NOT NULL)
            AND id NOT IN (SELECT new_highlightfile FROM changesetfiledifferences
                            WHERE new_highlightfile IS NOT NULL)
            AND id NOT IN (SELECT file FROM customhighlightrequests)",
        [],
    )?;

    report.code_contexts = tx.execute(
        "DELETE FROM codecontexts
          WHERE NOT EXISTS (
                SELECT 1 FROM highlightfiles AS hlf
                 WHERE hlf.sha1 = codecontexts.sha1
                   AND (hlf.language IS NULL OR hlf.language = codecontexts.language)
          )",
        [],
    )?;

    tx.commit()?;
    if report != GcReport::default() {
        tracing::info!(
            content_differences = report.content_differences,
            custom_highlight_requests = report.custom_highlight_requests,
            highlight_files = report.highlight_files,
            code_contexts = report.code_contexts,
            "garbage collected"
        );
    }
    Ok(report)
}
