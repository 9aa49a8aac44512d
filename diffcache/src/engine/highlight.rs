//! Syntax highlighting of shared highlight entries, plus the code contexts
//! recorded as a byproduct.

use std::sync::LazyLock;

use diffcache_core::highlight;
use diffcache_core::types::{CodeContext, HighlightFile, HighlightState, Token};
use regex::Regex;
use rusqlite::Connection;
use syntect::easy::HighlightLines;
use syntect::highlighting::{FontStyle, Style, ThemeSet};
use syntect::parsing::{SyntaxReference, SyntaxSet};
use syntect::util::LinesWithEndings;
use tracing::{debug, info};

use crate::engine::error::ComputeError;
use crate::git::GitReader;

static PS: LazyLock<SyntaxSet> = LazyLock::new(SyntaxSet::load_defaults_newlines);
static TS: LazyLock<ThemeSet> = LazyLock::new(ThemeSet::load_defaults);

static CONFLICT_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:<<<<<<< .*|=======|>>>>>>> .*)$").expect("static pattern"));

const MAX_CONTEXT_LABEL: usize = 256;

/// Forces the syntax and theme sets to load, so the first job does not pay
/// for it.
pub fn warm_up() {
    let _ = &*PS;
    let _ = &*TS;
}

/// Language of a file judged by its path alone: extension first, then the
/// whole file name (`Makefile`, `Dockerfile`). Plain text counts as none.
pub fn language_for_path(path: &str) -> Option<String> {
    let name = path.rsplit('/').next().unwrap_or(path);
    let syntax = name
        .rsplit_once('.')
        .and_then(|(_, ext)| PS.find_syntax_by_extension(ext))
        .or_else(|| PS.find_syntax_by_extension(name))?;
    known(syntax).map(|s| s.name.clone())
}

fn known(syntax: &SyntaxReference) -> Option<&SyntaxReference> {
    (syntax.name != PS.find_syntax_plain_text().name).then_some(syntax)
}

/// Picks the grammar for an entry: its recorded language, or failing that
/// whatever the first line gives away (shebang, modeline, XML prolog).
fn syntax_for(entry: &HighlightFile, text: &str) -> Option<&'static SyntaxReference> {
    if let Some(language) = &entry.language {
        if let Some(syntax) = PS.find_syntax_by_name(language) {
            return Some(syntax);
        }
    }
    let first = text.lines().next()?;
    PS.find_syntax_by_first_line(first).and_then(known)
}

/// Highlights entry `id` if it is still requested.
///
/// Returns `true` when lines were stored. An entry whose language cannot be
/// detected is dropped back to idle, which is not an error.
pub fn highlight_entry(
    db: &mut Connection,
    git: &GitReader,
    id: i64,
    theme: &str,
) -> Result<bool, ComputeError> {
    let Some(entry) = highlight::fetch(db, id)? else {
        return Ok(false);
    };
    if entry.state != HighlightState::Requested {
        return Ok(false);
    }

    let blob = git.read_blob(&entry.sha1)?;
    let text = String::from_utf8_lossy(&blob);
    let Some(syntax) = syntax_for(&entry, &text) else {
        debug!(highlight_file = id, sha1 = %entry.sha1, "no language detected");
        highlight::drop_request(db, id)?;
        return Ok(false);
    };
    let theme = TS
        .themes
        .get(theme)
        .or_else(|| TS.themes.values().next())
        .ok_or_else(|| ComputeError::Invariant("no highlight themes available".into()))?;

    let mut highlighter = HighlightLines::new(syntax, theme);
    let mut encoded = Vec::new();
    let mut plain = Vec::new();
    for line in LinesWithEndings::from(&text) {
        let content = line.trim_end_matches(['\n', '\r']);
        let tokens = if entry.conflicts && CONFLICT_MARKER.is_match(content) {
            vec![Token {
                text: content.to_owned(),
                fg: None,
                bold: false,
                italic: false,
                underline: false,
            }]
        } else {
            highlighter
                .highlight_line(line, &PS)?
                .into_iter()
                .filter_map(|(style, text)| syntect_to_token(style, text))
                .collect()
        };
        encoded.push(highlight::encode_line(&tokens)?);
        plain.push(content);
    }

    let contexts = code_contexts(&syntax.name, &plain);
    let stored = highlight::store_lines(db, id, &syntax.name, &encoded, &contexts)?;
    if stored {
        info!(
            highlight_file = id,
            language = %syntax.name,
            lines = encoded.len(),
            contexts = contexts.len(),
            "highlighted"
        );
    }
    Ok(stored)
}

/// Converts one syntect fragment into a stored token. Line terminators are
/// not part of the payload; a fragment that was nothing else is dropped.
fn syntect_to_token(style: Style, text: &str) -> Option<Token> {
    let text = text.trim_end_matches(['\n', '\r']);
    if text.is_empty() {
        return None;
    }
    let c = style.foreground;
    Some(Token {
        text: text.to_owned(),
        fg: (c.a > 0).then(|| format!("#{:02x}{:02x}{:02x}", c.r, c.g, c.b)),
        bold: style.font_style.contains(FontStyle::BOLD),
        italic: style.font_style.contains(FontStyle::ITALIC),
        underline: style.font_style.contains(FontStyle::UNDERLINE),
    })
}

enum Scope {
    /// The declaration's body is delimited by braces.
    Braces,
    /// The body is everything indented deeper than the declaration.
    Indent,
}

static RUST_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^\s*(?:pub(?:\([^)]*\))?\s+)?(?:(?:async|const|unsafe|default|extern(?:\s+"[^"]*")?)\s+)*(?:fn|struct|enum|trait|impl|mod|union|macro_rules!)\b"#,
    )
    .expect("static pattern")
});
static PYTHON_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:async\s+)?(?:def|class)\s+\w+").expect("static pattern"));
static C_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:typedef\s+)?(?:struct|union|enum)\s+\w+[^;]*$|[A-Za-z_][\w\s\*]*\b\w+\s*\([^;]*$)")
        .expect("static pattern")
});
static CPP_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:template\s*<.*>\s*)?(?:(?:class|struct|union|enum|namespace)\s+\w+[^;]*$)|^[A-Za-z_][\w:<>,\s\*&~]*\b[\w:~]+\s*\([^;]*$",
    )
    .expect("static pattern")
});
static JAVA_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:public|protected|private|static|final|abstract|sealed)\s+)*(?:class|interface|enum|record)\s+\w+|^\s*(?:(?:public|protected|private|static|final|abstract|synchronized|native)\s+)+[\w<>\[\],\s]+\s+\w+\s*\([^;]*$",
    )
    .expect("static pattern")
});
static JS_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:(?:async\s+)?function\*?\s+\w+|(?:abstract\s+)?class\s+\w+|interface\s+\w+|namespace\s+\w+)",
    )
    .expect("static pattern")
});
static GO_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:func\b|type\s+\w+\s+(?:struct|interface)\b)").expect("static pattern"));

fn declaration_pattern(language: &str) -> Option<(&'static Regex, Scope)> {
    let pattern = match language {
        "Rust" => (&*RUST_DECL, Scope::Braces),
        "Python" => (&*PYTHON_DECL, Scope::Indent),
        "C" => (&*C_DECL, Scope::Braces),
        "C++" => (&*CPP_DECL, Scope::Braces),
        "Java" => (&*JAVA_DECL, Scope::Braces),
        "JavaScript" | "TypeScript" | "TypeScriptReact" => (&*JS_DECL, Scope::Braces),
        "Go" => (&*GO_DECL, Scope::Braces),
        _ => return None,
    };
    Some(pattern)
}

/// Lines a brace-scoped declaration may take before its body opens.
const MAX_SIGNATURE_LINES: usize = 20;

/// Finds the declarations of `lines` and the line ranges they cover.
///
/// Line numbers are zero-based and inclusive. Declarations nest, so ranges
/// may overlap; the innermost one wins on lookup.
pub fn code_contexts(language: &str, lines: &[&str]) -> Vec<CodeContext> {
    let Some((pattern, scope)) = declaration_pattern(language) else {
        return Vec::new();
    };
    let mut contexts = Vec::new();
    for (first, line) in lines.iter().enumerate() {
        if !pattern.is_match(line) {
            continue;
        }
        let last = match scope {
            Scope::Braces => brace_scope_end(lines, first),
            Scope::Indent => Some(indent_scope_end(lines, first)),
        };
        if let Some(last) = last {
            contexts.push(CodeContext {
                first_line: first as i64,
                last_line: last as i64,
                context: label(line),
            });
        }
    }
    contexts
}

fn brace_scope_end(lines: &[&str], first: usize) -> Option<usize> {
    let mut depth = 0i64;
    let mut opened = false;
    for (index, line) in lines.iter().enumerate().skip(first) {
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    opened = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if opened && depth <= 0 {
            return Some(index);
        }
        if !opened {
            if line.trim_end().ends_with(';') {
                return Some(index);
            }
            if index - first >= MAX_SIGNATURE_LINES {
                return None;
            }
        }
    }
    opened.then(|| lines.len() - 1)
}

fn indent_scope_end(lines: &[&str], first: usize) -> usize {
    let depth = indentation(lines[first]);
    let mut last = first;
    for (index, line) in lines.iter().enumerate().skip(first + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indentation(line) <= depth {
            break;
        }
        last = index;
    }
    last
}

fn indentation(line: &str) -> usize {
    line.chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { 8 } else { 1 })
        .sum()
}

fn label(line: &str) -> String {
    let label = line.trim().trim_end_matches(['{', ':']).trim_end();
    label.chars().take(MAX_CONTEXT_LABEL).collect()
}
