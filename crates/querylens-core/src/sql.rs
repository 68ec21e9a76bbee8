//! Statement classification and table-name extraction.
//!
//! Both functions are keyword heuristics over the raw text, not a parser.
//! They never fail: unrecognized input classifies as [`QueryType::Other`] and
//! extraction returns whatever it could find (possibly nothing). Known gaps:
//! schema-qualified names keep their qualifier, aliases are ignored, and a
//! nested subquery only contributes the tables its own clauses name.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::QueryType;

/// Leading keywords recognized by [`classify`], in match order.
const LEADING_KEYWORDS: [(&str, QueryType); 7] = [
    ("SELECT", QueryType::Select),
    ("INSERT", QueryType::Insert),
    ("UPDATE", QueryType::Update),
    ("DELETE", QueryType::Delete),
    ("CREATE", QueryType::Create),
    ("DROP", QueryType::Drop),
    ("ALTER", QueryType::Alter),
];

/// Clause patterns run against the uppercased statement.
struct ClausePatterns {
    from: Regex,
    join: Regex,
    insert_into: Regex,
    update: Regex,
    delete_from: Regex,
}

static CLAUSES: LazyLock<ClausePatterns> = LazyLock::new(|| ClausePatterns {
    from: Regex::new(r"\bFROM\s+([^\s,]+)").unwrap(),
    join: Regex::new(r"\bJOIN\s+([^\s,]+)").unwrap(),
    insert_into: Regex::new(r"\bINSERT\s+INTO\s+([^\s,(]+)").unwrap(),
    update: Regex::new(r"\bUPDATE\s+([^\s,]+)").unwrap(),
    delete_from: Regex::new(r"\bDELETE\s+FROM\s+([^\s,]+)").unwrap(),
});

/// Classify a statement by its leading keyword.
///
/// Only the first keyword after trimming is inspected, case-insensitively.
/// A leading comment or any other keyword (`EXPLAIN`, `WITH`, `PRAGMA`)
/// yields [`QueryType::Other`].
#[must_use]
pub fn classify(sql: &str) -> QueryType {
    let head = sql.trim_start();
    LEADING_KEYWORDS
        .iter()
        .find(|(keyword, _)| starts_with_ignore_case(head, keyword))
        .map_or(QueryType::Other, |&(_, kind)| kind)
}

fn starts_with_ignore_case(text: &str, keyword: &str) -> bool {
    text.len() >= keyword.len()
        && text.as_bytes()[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
}

/// Extract the table names a statement touches, lowercased and deduplicated.
///
/// Candidates are collected in clause order: the first `FROM`, every `JOIN`,
/// the first `INSERT INTO`, `UPDATE` and `DELETE FROM`. Each candidate is the
/// whitespace/comma-delimited token after the clause keyword with quoting
/// stripped. Parenthesized tokens (subqueries) are skipped.
#[must_use]
pub fn extract_table_names(sql: &str) -> Vec<String> {
    let upper = sql.to_uppercase();
    let patterns = &*CLAUSES;

    let mut candidates: Vec<&str> = Vec::new();
    candidates.extend(first_capture(&patterns.from, &upper));
    candidates.extend(
        patterns
            .join
            .captures_iter(&upper)
            .filter_map(|c| c.get(1).map(|m| m.as_str())),
    );
    candidates.extend(first_capture(&patterns.insert_into, &upper));
    candidates.extend(first_capture(&patterns.update, &upper));
    candidates.extend(first_capture(&patterns.delete_from, &upper));

    let mut tables: Vec<String> = Vec::with_capacity(candidates.len());
    for raw in candidates {
        let Some(table) = clean_identifier(raw) else {
            continue;
        };
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    tables
}

fn first_capture<'t>(pattern: &Regex, text: &'t str) -> Option<&'t str> {
    pattern
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// Strip quoting and trailing punctuation, reject subqueries and empties.
fn clean_identifier(raw: &str) -> Option<String> {
    if raw.starts_with('(') {
        return None;
    }
    let trimmed = raw
        .trim_end_matches([';', ')'])
        .trim_matches(|c| matches!(c, '"' | '\'' | '`' | '[' | ']'));
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.to_lowercase())
}

/// Truncate SQL for log lines, respecting char boundaries.
#[must_use]
pub fn truncate_sql(sql: &str, max_chars: usize) -> std::borrow::Cow<'_, str> {
    match sql.char_indices().nth(max_chars) {
        Some((cut, _)) => std::borrow::Cow::Owned(format!("{}...", &sql[..cut])),
        None => std::borrow::Cow::Borrowed(sql),
    }
}
