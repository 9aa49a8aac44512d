//! Intra-line analysis of a block of changed lines.
//!
//! Deleted and inserted lines are paired by word-level similarity, then each
//! pair is described by the character ranges that differ. The result is an
//! opaque string of `;`-separated items, one per paired line:
//!
//! * `d=i`: line `d` of the deleted span became line `i` of the inserted
//!   span unchanged, or with only the edits that follow after a `:`.
//! * `ra-b=c-d`: characters `a..b` were replaced by `c..d`.
//! * `da-b` / `ic-d`: characters deleted from the old line / inserted into
//!   the new one.
//! * `ws`: the pair differs in whitespace only.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use similar::{capture_diff_slices, Algorithm, DiffOp, DiffTag};

/// Above this many line pairs, lines are matched on their normalized text
/// instead of compared pairwise.
pub const MAX_PAIRWISE: usize = 10_000;

static WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[0-9]+|[A-Z][a-z]+|[A-Z]+|[a-z]+|[\[\]{}()]|\s+|.").expect("static pattern")
});
static IGNORED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:[{}*]|else|do|\*/)?\s*$").expect("static pattern"));
static CONFLICT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:<<<<<<< .*|=======|>>>>>>> .*)$").expect("static pattern"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static pattern"));
static WHITESPACE_WORDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"( |\t|\s+|\S+)").expect("static pattern"));

/// Analyzes one block. Returns `None` when either side is empty: there is
/// nothing to pair.
pub fn analyze_chunk(deleted: &[&str], inserted: &[&str]) -> Option<String> {
    if deleted.is_empty() || inserted.is_empty() {
        return None;
    }
    if deleted.len() * inserted.len() <= MAX_PAIRWISE {
        return Some(pair_lines(deleted, inserted, 0, 0));
    }

    let normalized_deleted = normalize(deleted, "d");
    let normalized_inserted = normalize(inserted, "i");
    let ops = capture_diff_slices(Algorithm::Myers, &normalized_deleted, &normalized_inserted);

    let mut items = Vec::new();
    let (mut pd, mut pi) = (0, 0);
    for op in &ops {
        let &DiffOp::Equal { old_index, new_index, len } = op else {
            continue;
        };
        if old_index > pd && new_index > pi {
            items.push(pair_lines(&deleted[pd..old_index], &inserted[pi..new_index], pd, pi));
        }
        items.push(whitespace_changes(
            &deleted[old_index..old_index + len],
            &inserted[new_index..new_index + len],
            old_index,
            new_index,
        ));
        pd = old_index + len;
        pi = new_index + len;
    }
    if pd < deleted.len() && pi < inserted.len() {
        items.push(pair_lines(&deleted[pd..], &inserted[pi..], pd, pi));
    }
    items.retain(|item| !item.is_empty());
    Some(items.join(";"))
}

/// Collapses whitespace so re-indented lines compare equal. Conflict
/// markers get a text no other line has, so they are never matched.
fn normalize(lines: &[&str], side: &str) -> Vec<String> {
    lines
        .iter()
        .enumerate()
        .map(|(index, line)| {
            if CONFLICT_MARKER.is_match(line) {
                format!("\0{side}{index}")
            } else {
                WHITESPACE.replace_all(line.trim(), " ").into_owned()
            }
        })
        .collect()
}

struct Candidate<'a> {
    ratio: f64,
    deleted: usize,
    inserted: usize,
    deleted_words: Vec<&'a str>,
    inserted_words: Vec<&'a str>,
    ops: Vec<DiffOp>,
}

fn words(line: &str) -> Vec<&str> {
    WORDS.find_iter(line).map(|m| m.as_str()).collect()
}

fn non_whitespace_len(line: &str) -> usize {
    line.chars().filter(|c| !c.is_whitespace()).count()
}

/// Share of matching non-whitespace characters between two word lists.
///
/// A long old line that survives as one contiguous run is measured against
/// itself only, so wrapping it in new code still counts as a match.
fn similarity(ops: &[DiffOp], deleted_words: &[&str], deleted_len: usize, inserted_len: usize) -> f64 {
    let mut matching = 0;
    let mut runs = 0;
    for op in ops {
        if let &DiffOp::Equal { old_index, len, .. } = op {
            runs += 1;
            matching += deleted_words[old_index..old_index + len]
                .iter()
                .map(|w| w.trim().chars().count())
                .sum::<usize>();
        }
    }
    if deleted_len > 5 && runs == 1 {
        matching as f64 / deleted_len as f64
    } else if deleted_len + inserted_len == 0 {
        0.0
    } else {
        2.0 * matching as f64 / (deleted_len + inserted_len) as f64
    }
}

/// Pairs lines of the two spans and describes each pair. `offset_*` is
/// added to every emitted line number.
fn pair_lines(deleted: &[&str], inserted: &[&str], offset_deleted: usize, offset_inserted: usize) -> String {
    if deleted.len() * inserted.len() > MAX_PAIRWISE {
        return String::new();
    }

    let mut candidates = Vec::new();
    let mut equals = Vec::new();
    for (di, &d) in deleted.iter().enumerate() {
        if CONFLICT_MARKER.is_match(d) {
            continue;
        }
        let d_trimmed = d.trim();
        if IGNORED_LINE.is_match(d) {
            for (ii, &i) in inserted.iter().enumerate() {
                if d_trimmed == i.trim() {
                    equals.push((di, ii));
                }
            }
            continue;
        }
        let deleted_words = words(d);
        for (ii, &i) in inserted.iter().enumerate() {
            if IGNORED_LINE.is_match(i) {
                if d_trimmed == i.trim() {
                    equals.push((di, ii));
                }
                continue;
            }
            let inserted_words = words(i);
            let ops = capture_diff_slices(Algorithm::Myers, &deleted_words, &inserted_words);
            let ratio = similarity(&ops, &deleted_words, non_whitespace_len(d), non_whitespace_len(i));
            if ratio > 0.5 {
                candidates.push(Candidate {
                    ratio,
                    deleted: di,
                    inserted: ii,
                    deleted_words: deleted_words.clone(),
                    inserted_words,
                    ops,
                });
            }
        }
    }

    if candidates.is_empty() {
        return trailing_equal_lines(deleted, inserted, offset_deleted, offset_inserted);
    }

    // Best pairs first; each accepted pair excludes every candidate that
    // shares a line with it or would cross it.
    candidates.sort_by(|a, b| b.ratio.total_cmp(&a.ratio));
    let mut accepted = Vec::new();
    let mut remaining: VecDeque<_> = candidates.into();
    while let Some(best) = remaining.pop_front() {
        let (bd, bi) = (best.deleted, best.inserted);
        remaining.retain(|c| c.deleted != bd && c.inserted != bi && (c.deleted < bd) == (c.inserted < bi));
        equals.retain(|&(d, i)| (d < bd) == (i < bi));
        accepted.push(best);
    }
    accepted.sort_by_key(|c| (c.deleted, c.inserted));
    equals.sort_unstable();
    let mut equals: VecDeque<_> = equals.into();

    let mut result = Vec::new();
    let (mut prev_d, mut prev_i) = (-1isize, -1isize);
    let sentinel = (deleted.len(), inserted.len());
    let stops = accepted
        .iter()
        .map(|c| ((c.deleted, c.inserted), Some(c)))
        .chain(std::iter::once((sentinel, None)));
    for ((cd, ci), candidate) in stops {
        while let Some(&(di, ii)) = equals.front() {
            if !(di < cd || ii < ci) {
                break;
            }
            equals.pop_front();
            let (sd, si) = (di as isize, ii as isize);
            if prev_d < sd && sd < cd as isize && prev_i < si && si < ci as isize {
                let diff = whitespace_line_diff(deleted[di], inserted[ii]);
                let (d, i) = (di + offset_deleted, ii + offset_inserted);
                if diff.is_empty() {
                    result.push(format!("{d}={i}"));
                } else {
                    result.push(format!("{d}={i}:ws,{diff}"));
                }
                prev_d = sd;
                prev_i = si;
            }
            while equals.front().is_some_and(|&(d, i)| d == di || i == ii) {
                equals.pop_front();
            }
        }

        let Some(candidate) = candidate else {
            break;
        };
        let d_line = deleted[cd];
        let i_line = inserted[ci];
        let mut edits = Vec::new();
        if d_line != i_line && d_line.trim() == i_line.trim() {
            edits.push("ws".to_owned());
            let diff = whitespace_line_diff(d_line, i_line);
            if !diff.is_empty() {
                edits.push(diff);
            }
        } else {
            edits.extend(describe(&candidate.ops, &candidate.deleted_words, &candidate.inserted_words));
        }
        let mut item = format!("{}={}", cd + offset_deleted, ci + offset_inserted);
        if !edits.is_empty() {
            item.push(':');
            item.push_str(&edits.join(","));
        }
        result.push(item);
        prev_d = cd as isize;
        prev_i = ci as isize;
    }
    result.join(";")
}

/// With nothing similar enough to pair, still report identical trailing
/// lines (typically closing braces).
fn trailing_equal_lines(deleted: &[&str], inserted: &[&str], offset_deleted: usize, offset_inserted: usize) -> String {
    let mut result: Vec<String> = deleted
        .iter()
        .rev()
        .zip(inserted.iter().rev())
        .enumerate()
        .take_while(|(_, (d, i))| d == i)
        .map(|(back, _)| {
            format!(
                "{}={}",
                deleted.len() - 1 - back + offset_deleted,
                inserted.len() - 1 - back + offset_inserted
            )
        })
        .collect();
    result.reverse();
    result.join(";")
}

/// Describes lines already known to match after whitespace normalization.
fn whitespace_changes(deleted: &[&str], inserted: &[&str], offset_deleted: usize, offset_inserted: usize) -> String {
    let mut result: Vec<String> = deleted
        .iter()
        .zip(inserted)
        .enumerate()
        .filter(|(_, (d, i))| d != i)
        .map(|(index, (d, i))| {
            format!(
                "{}={}:{}",
                index + offset_deleted,
                index + offset_inserted,
                whitespace_line_diff(d, i)
            )
        })
        .collect();
    if result.is_empty() && (offset_deleted > 0 || offset_inserted > 0) {
        result.push(format!("{offset_deleted}={offset_inserted}"));
    }
    result.join(";")
}

fn whitespace_line_diff(deleted: &str, inserted: &str) -> String {
    let deleted_words: Vec<&str> = WHITESPACE_WORDS.find_iter(deleted).map(|m| m.as_str()).collect();
    let inserted_words: Vec<&str> = WHITESPACE_WORDS.find_iter(inserted).map(|m| m.as_str()).collect();
    let ops = capture_diff_slices(Algorithm::Myers, &deleted_words, &inserted_words);
    describe(&ops, &deleted_words, &inserted_words).join(",")
}

/// Character offset of word `index` within its line.
fn offset_in_line(words: &[&str], index: usize) -> usize {
    words[..index].iter().map(|w| w.chars().count()).sum()
}

/// Renders the non-equal stretches of a word diff as edit items. Adjacent
/// deletes and inserts are reported together as one replacement.
fn describe(ops: &[DiffOp], deleted_words: &[&str], inserted_words: &[&str]) -> Vec<String> {
    let mut items = Vec::new();
    let mut pending: Option<(Range<usize>, Range<usize>)> = None;
    let flush = |pending: &mut Option<(Range<usize>, Range<usize>)>, items: &mut Vec<String>| {
        let Some((old, new)) = pending.take() else {
            return;
        };
        let (a, b) = (offset_in_line(deleted_words, old.start), offset_in_line(deleted_words, old.end));
        let (c, d) = (offset_in_line(inserted_words, new.start), offset_in_line(inserted_words, new.end));
        items.push(match (old.is_empty(), new.is_empty()) {
            (false, false) => format!("r{a}-{b}={c}-{d}"),
            (false, true) => format!("d{a}-{b}"),
            (true, false) => format!("i{c}-{d}"),
            (true, true) => return,
        });
    };
    for op in ops {
        let (tag, old, new) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            flush(&mut pending, &mut items);
            continue;
        }
        pending = Some(match pending.take() {
            Some((o, n)) => (o.start..old.end, n.start..new.end),
            None => (old, new),
        });
    }
    flush(&mut pending, &mut items);
    items
}
