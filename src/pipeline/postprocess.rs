//! Deterministic clean-up of model output.
//!
//! Vision models are asked for plain descriptions but still wrap replies in
//! code fences, emit `\r\n`, pad lines with spaces or sprinkle zero-width
//! characters. [`clean_description`] removes those artefacts without
//! touching the wording.
//!
//! Rule order matters: fences are stripped on the raw reply, line endings
//! are normalised before anything works line by line.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply every rule, in order:
///
/// 1. Strip a fence wrapping the whole reply (` ```text `, ` ```markdown `, bare ` ``` `)
/// 2. Normalise line endings (CRLF and lone CR → LF)
/// 3. Drop invisible Unicode (zero-width spaces, BOM, soft hyphens, joiners)
/// 4. Trim trailing whitespace per line
/// 5. Collapse runs of blank lines to a single blank line
/// 6. Trim leading and trailing blank lines
pub fn clean_description(input: &str) -> String {
    let s = strip_wrapping_fence(input);
    let s = normalise_line_endings(&s);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = collapse_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

// ── Rule 1: wrapping fence ───────────────────────────────────────────────

static RE_OUTER_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\r?\n(.*?)\r?\n```[ \t]*$").unwrap()
});

fn strip_wrapping_fence(input: &str) -> String {
    let trimmed = input.trim();
    match RE_OUTER_FENCE.captures(trimmed) {
        // An inner fence means the reply is several blocks, not one wrapped reply.
        Some(caps) if !caps[1].contains("```") => caps[1].to_string(),
        _ => input.to_string(),
    }
}

// ── Rule 2: line endings ─────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: invisible characters ─────────────────────────────────────────

const INVISIBLE: [char; 6] = [
    '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
];

fn remove_invisible_chars(input: &str) -> String {
    input.replace(INVISIBLE, "")
}

// ── Rule 4: trailing whitespace ──────────────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 5: blank-line runs ──────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n").into_owned()
}
