//! Content difference jobs: examine a changed file, compare its lines, and
//! analyze the resulting blocks.

use diffcache_core::changesets;
use diffcache_core::content;
use diffcache_core::types::{
    ChangedFile, ChangedLineBlock, Changeset, FileDifference, FileSide, HighlightKey, MODE_GITLINK,
    MODE_TYPE_MASK,
};
use rusqlite::Connection;
use similar::{capture_diff_slices, Algorithm, DiffTag};
use tracing::debug;

use crate::engine::analysis;
use crate::engine::error::ComputeError;
use crate::engine::highlight::language_for_path;
use crate::git::GitReader;

/// Bytes inspected for a NUL when deciding whether a blob is binary.
pub const BINARY_SCAN_BYTES: usize = 8000;

struct Side {
    sha1: String,
    facts: FileSide,
}

fn is_binary(content: &[u8]) -> bool {
    content[..content.len().min(BINARY_SCAN_BYTES)].contains(&0)
}

fn read_side(git: &GitReader, sha1: Option<&str>, mode: Option<i64>) -> Result<Option<Side>, ComputeError> {
    let Some(sha1) = sha1 else {
        return Ok(None);
    };
    // A submodule entry names a commit in another repository.
    if mode.is_some_and(|m| m & MODE_TYPE_MASK == MODE_GITLINK) {
        let facts = FileSide { is_binary: true, ..FileSide::default() };
        return Ok(Some(Side { sha1: sha1.to_owned(), facts }));
    }
    let blob = git.read_blob(sha1)?;
    let facts = if is_binary(&blob) {
        FileSide { is_binary: true, ..FileSide::default() }
    } else {
        let text = String::from_utf8_lossy(&blob);
        FileSide {
            is_binary: false,
            length: text.lines().count() as i64,
            linebreak: text.ends_with('\n'),
            highlight_file: None,
        }
    };
    Ok(Some(Side { sha1: sha1.to_owned(), facts }))
}

fn changed_file(db: &Connection, changeset: i64, file: i64) -> Result<ChangedFile, ComputeError> {
    changesets::changed_file(db, changeset, file)?
        .ok_or_else(|| ComputeError::Invariant(format!("file {file} is not part of changeset {changeset}")))
}

/// Reads both sides of a changed file and records its file difference.
///
/// Text sides get a highlight entry. Files that need a line comparison are
/// left with `comparison_pending`; whole-file additions and removals get
/// their single block right away.
pub fn examine_file(
    db: &mut Connection,
    git: &GitReader,
    changeset: &Changeset,
    file: i64,
) -> Result<(), ComputeError> {
    if content::file_difference(db, changeset.id, file)?.is_some() {
        return Ok(());
    }
    let changed = changed_file(db, changeset.id, file)?;
    let old = read_side(git, changed.old_sha1.as_deref(), changed.old_mode)?;
    let new = read_side(git, changed.new_sha1.as_deref(), changed.new_mode)?;

    let language = language_for_path(&changed.path);
    let key = |side: &Option<Side>, conflicts: bool| {
        side.as_ref().filter(|s| !s.facts.is_binary).map(|s| HighlightKey {
            sha1: s.sha1.clone(),
            language: language.clone(),
            conflicts,
        })
    };
    // The old side of a replay changeset is the replayed merge, with its
    // conflict markers.
    let old_key = key(&old, changeset.is_replay);
    let new_key = key(&new, false);

    let eligible = match (&old, &new) {
        (Some(o), Some(n)) => {
            !o.facts.is_binary && !n.facts.is_binary && o.sha1 != n.sha1 && changed.is_regular()
        }
        _ => false,
    };
    let mut blocks = Vec::new();
    match (&old, &new) {
        (None, Some(n)) if !n.facts.is_binary && n.facts.length > 0 => {
            blocks.push(whole_file_block(0, n.facts.length));
        }
        (Some(o), None) if !o.facts.is_binary && o.facts.length > 0 => {
            blocks.push(whole_file_block(o.facts.length, 0));
        }
        _ => {}
    }

    let difference = FileDifference {
        changeset: changeset.id,
        file,
        path: changed.path,
        comparison_pending: eligible,
        old: old.map(|s| s.facts),
        new: new.map(|s| s.facts),
    };
    let inserted = content::insert_file_difference(
        db,
        changeset.repository,
        &difference,
        [old_key.as_ref(), new_key.as_ref()],
        &blocks,
    )?;
    if inserted {
        debug!(changeset = changeset.id, file, path = %difference.path, eligible, "examined");
    }
    Ok(())
}

fn whole_file_block(deleted: i64, inserted: i64) -> ChangedLineBlock {
    ChangedLineBlock {
        index: 0,
        offset: 0,
        delete_count: deleted,
        delete_length: deleted,
        insert_count: inserted,
        insert_length: inserted,
        analysis: Some(String::new()),
    }
}

fn read_text(git: &GitReader, sha1: Option<&str>) -> Result<String, ComputeError> {
    match sha1 {
        Some(sha1) => Ok(String::from_utf8_lossy(&git.read_blob(sha1)?).into_owned()),
        None => Ok(String::new()),
    }
}

/// Computes and stores the blocks of a file whose comparison is pending.
pub fn compare_file(
    db: &mut Connection,
    git: &GitReader,
    changeset: &Changeset,
    file: i64,
    fold_context_lines: usize,
) -> Result<(), ComputeError> {
    let Some(difference) = content::file_difference(db, changeset.id, file)? else {
        return Err(ComputeError::Invariant(format!("file {file} of changeset {} is not examined", changeset.id)));
    };
    if !difference.comparison_pending {
        return Ok(());
    }
    let changed = changed_file(db, changeset.id, file)?;
    let old = read_text(git, changed.old_sha1.as_deref())?;
    let new = read_text(git, changed.new_sha1.as_deref())?;
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    let blocks = diff_blocks(&old_lines, &new_lines, fold_context_lines);
    if content::store_comparison(db, changeset.id, file, &blocks)? {
        debug!(changeset = changeset.id, file, blocks = blocks.len(), "compared");
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct Hunk {
    old_start: usize,
    old_end: usize,
    new_start: usize,
    new_end: usize,
    deleted: usize,
    inserted: usize,
}

/// Line diff of two files as ordered blocks.
///
/// Changes separated by at most `fold_context_lines` unchanged lines share
/// a block; the unchanged lines then count toward its lengths but not its
/// counts.
pub fn diff_blocks(old: &[&str], new: &[&str], fold_context_lines: usize) -> Vec<ChangedLineBlock> {
    let ops = capture_diff_slices(Algorithm::Myers, old, new);
    let mut hunks: Vec<Hunk> = Vec::new();
    for op in &ops {
        let (tag, o, n) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            continue;
        }
        match hunks.last_mut() {
            Some(h) if o.start - h.old_end <= fold_context_lines => {
                h.old_end = o.end;
                h.new_end = n.end;
                h.deleted += o.len();
                h.inserted += n.len();
            }
            _ => hunks.push(Hunk {
                old_start: o.start,
                old_end: o.end,
                new_start: n.start,
                new_end: n.end,
                deleted: o.len(),
                inserted: n.len(),
            }),
        }
    }

    let mut previous_end = 0;
    hunks
        .into_iter()
        .enumerate()
        .map(|(index, h)| {
            let offset = h.old_start - previous_end;
            previous_end = h.old_end;
            let pure = h.deleted == 0 || h.inserted == 0;
            ChangedLineBlock {
                index: index as i64,
                offset: offset as i64,
                delete_count: h.deleted as i64,
                delete_length: (h.old_end - h.old_start) as i64,
                insert_count: h.inserted as i64,
                insert_length: (h.new_end - h.new_start) as i64,
                analysis: pure.then(String::new),
            }
        })
        .collect()
}

/// Computes the analysis of one block and stores it.
///
/// Also serves synchronous requests, so the result is returned even when it
/// was already stored.
pub fn analyze_block(
    db: &mut Connection,
    git: &GitReader,
    changeset: &Changeset,
    file: i64,
    index: i64,
) -> Result<String, ComputeError> {
    let blocks = content::changed_lines(db, changeset.id, file)?;
    let position = blocks.iter().position(|b| b.index == index).ok_or_else(|| {
        ComputeError::Invariant(format!("block {index} of file {file} in changeset {} does not exist", changeset.id))
    })?;
    let block = &blocks[position];
    if let Some(analysis) = &block.analysis {
        return Ok(analysis.clone());
    }
    if !block.needs_analysis() {
        content::set_analysis(db, changeset.id, file, index, "")?;
        return Ok(String::new());
    }

    // Offsets are relative to the end of the previous block on both sides.
    let (mut old_start, mut new_start) = (0, 0);
    for b in &blocks[..position] {
        old_start += b.offset + b.delete_length;
        new_start += b.offset + b.insert_length;
    }
    old_start += block.offset;
    new_start += block.offset;

    let changed = changed_file(db, changeset.id, file)?;
    let old = read_text(git, changed.old_sha1.as_deref())?;
    let new = read_text(git, changed.new_sha1.as_deref())?;
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let deleted = span(&old_lines, old_start, block.delete_length)?;
    let inserted = span(&new_lines, new_start, block.insert_length)?;

    let analysis = analysis::analyze_chunk(deleted, inserted).unwrap_or_default();
    content::set_analysis(db, changeset.id, file, index, &analysis)?;
    debug!(changeset = changeset.id, file, block = index, "analyzed");
    Ok(analysis)
}

fn span<'a>(lines: &'a [&'a str], start: i64, length: i64) -> Result<&'a [&'a str], ComputeError> {
    let start = usize::try_from(start).map_err(|_| ComputeError::Invariant(format!("negative line {start}")))?;
    let end = start + usize::try_from(length).unwrap_or(0);
    lines
        .get(start..end)
        .ok_or_else(|| ComputeError::Invariant(format!("lines {start}..{end} out of range ({})", lines.len())))
}
