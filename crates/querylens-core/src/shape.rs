//! Statement "shape": SQL with literal values replaced by placeholders.
//!
//! Two statements with the same shape differ only in the values they bind,
//! which is how a per-row query issued in a loop (N+1) shows up in a capture
//! log. Like [`crate::sql`], this is a regex heuristic, not a tokenizer.

use std::sync::LazyLock;

use regex::Regex;

/// `IN ( ... )` argument list without nested parentheses.
static IN_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bIN\s*\([^)]+\)").unwrap());

/// Right-hand side of `=`: positional marker, number, or quoted string.
static EQ_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\s*(?:%s|\?|\$\d+|-?\d+(?:\.\d+)?\b|'(?:[^']|'')*')").unwrap()
});

/// Normalize a statement to its shape.
///
/// 1. Whitespace runs collapse to one space; ends are trimmed.
/// 2. `IN (...)` lists become `IN (?)`.
/// 3. `= <marker | number | 'string'>` becomes `= ?`.
#[must_use]
pub fn normalize_shape(sql: &str) -> String {
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    let without_lists = IN_LIST.replace_all(&collapsed, "IN (?)");
    EQ_LITERAL.replace_all(&without_lists, "= ?").into_owned()
}
