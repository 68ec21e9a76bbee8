//! Read-only aggregations over a capture log.
//!
//! Every function takes the log as a slice and returns references into it;
//! the collector clones the results when it hands them out. Groupings keep
//! first-seen key order and execution order within each group.

use std::time::Duration;

use indexmap::IndexMap;
use querylens_core::{CapturedQuery, Config, QueryStatus, QueryType, StackFrame};
use serde::{Deserialize, Serialize};

/// Call-site label used when no stack frames were captured.
pub const UNKNOWN_CALL_SITE: &str = "unknown";

/// Sum of all recorded durations.
#[must_use]
pub fn total_duration(log: &[CapturedQuery]) -> Duration {
    log.iter().map(CapturedQuery::duration).sum()
}

#[must_use]
pub fn group_by_type(log: &[CapturedQuery]) -> IndexMap<QueryType, Vec<&CapturedQuery>> {
    group_by(log, CapturedQuery::query_type)
}

/// Group by touched table; a statement touching several tables is listed
/// under each of them.
#[must_use]
pub fn group_by_table(log: &[CapturedQuery]) -> IndexMap<String, Vec<&CapturedQuery>> {
    let mut groups: IndexMap<String, Vec<&CapturedQuery>> = IndexMap::new();
    for query in log {
        for table in query.table_names() {
            groups.entry(table.clone()).or_default().push(query);
        }
    }
    groups
}

/// Statements whose text, ignoring surrounding whitespace, occurs at least
/// twice. Parameters are not compared.
#[must_use]
pub fn exact_duplicates(log: &[CapturedQuery]) -> IndexMap<String, Vec<&CapturedQuery>> {
    repeated(group_by(log, |q| q.sql().trim().to_string()), 2)
}

/// Statements sharing a normalized shape, keyed by that shape.
#[must_use]
pub fn similar_queries(log: &[CapturedQuery]) -> IndexMap<String, Vec<&CapturedQuery>> {
    repeated(group_by(log, CapturedQuery::shape), 2)
}

/// Statements that took at least `threshold`, in log order.
#[must_use]
pub fn slow_queries(log: &[CapturedQuery], threshold: Duration) -> Vec<&CapturedQuery> {
    log.iter().filter(|q| q.duration() >= threshold).collect()
}

#[must_use]
pub fn failed_queries(log: &[CapturedQuery]) -> Vec<&CapturedQuery> {
    log.iter()
        .filter(|q| q.status() == QueryStatus::Error)
        .collect()
}

/// A statement shape repeated from one call site.
#[derive(Debug, Clone, Serialize)]
pub struct NPlusOneCandidate {
    pub shape: String,
    /// Innermost captured frame; `None` when stack capture was off.
    pub call_site: Option<StackFrame>,
    pub queries: Vec<CapturedQuery>,
}

impl NPlusOneCandidate {
    #[must_use]
    pub fn count(&self) -> usize {
        self.queries.len()
    }

    #[must_use]
    pub fn total_duration(&self) -> Duration {
        total_duration(&self.queries)
    }

    /// `file:line in function`, or [`UNKNOWN_CALL_SITE`].
    #[must_use]
    pub fn call_site_label(&self) -> String {
        self.call_site
            .as_ref()
            .map_or_else(|| UNKNOWN_CALL_SITE.to_string(), ToString::to_string)
    }
}

/// Similar-shape groups split by call site, keeping groups of at least
/// `min_repeats` statements (never fewer than 2).
#[must_use]
pub fn n_plus_one_candidates(log: &[CapturedQuery], min_repeats: usize) -> Vec<NPlusOneCandidate> {
    let min_repeats = min_repeats.max(2);
    let groups = group_by(log, |q| (q.shape(), q.call_site().cloned()));
    groups
        .into_iter()
        .filter(|(_, members)| members.len() >= min_repeats)
        .map(|((shape, call_site), members)| NPlusOneCandidate {
            shape,
            call_site,
            queries: members.into_iter().cloned().collect(),
        })
        .collect()
}

/// Clone borrowed groups for handing out past a lock.
#[must_use]
pub fn owned_groups<K: std::hash::Hash + Eq>(
    groups: IndexMap<K, Vec<&CapturedQuery>>,
) -> IndexMap<K, Vec<CapturedQuery>> {
    groups
        .into_iter()
        .map(|(key, members)| (key, members.into_iter().cloned().collect()))
        .collect()
}

fn group_by<'a, K, F>(log: &'a [CapturedQuery], key: F) -> IndexMap<K, Vec<&'a CapturedQuery>>
where
    K: std::hash::Hash + Eq,
    F: Fn(&'a CapturedQuery) -> K,
{
    let mut groups: IndexMap<K, Vec<&CapturedQuery>> = IndexMap::new();
    for query in log {
        groups.entry(key(query)).or_default().push(query);
    }
    groups
}

fn repeated<K: std::hash::Hash + Eq>(
    mut groups: IndexMap<K, Vec<&CapturedQuery>>,
    min: usize,
) -> IndexMap<K, Vec<&CapturedQuery>> {
    groups.retain(|_, members| members.len() >= min);
    groups
}

// =============================================================================
// CaptureSnapshot
// =============================================================================

/// Summary of one statement group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub key: String,
    pub count: usize,
    pub total_time_ms: f64,
    /// Sequence numbers of the members, in execution order.
    pub sequences: Vec<u64>,
}

impl GroupSummary {
    fn new(key: String, members: &[&CapturedQuery]) -> Self {
        Self {
            key,
            count: members.len(),
            total_time_ms: round_ms(members.iter().map(|q| q.duration()).sum()),
            sequences: members.iter().map(|q| q.sequence()).collect(),
        }
    }
}

/// A statement over the slow-query threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowQueryEntry {
    pub sequence: u64,
    pub sql: String,
    pub query_type: QueryType,
    pub tables: Vec<String>,
    pub duration_ms: f64,
}

/// Immutable summary of a capture log, suitable for serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureSnapshot {
    pub total: usize,
    pub total_time_ms: f64,
    pub failed: usize,
    pub per_type: IndexMap<QueryType, usize>,
    pub per_table: IndexMap<String, usize>,
    pub duplicates: Vec<GroupSummary>,
    pub similar: Vec<GroupSummary>,
    pub slow_query_ms: u64,
    pub slow_queries: Vec<SlowQueryEntry>,
    pub n_plus_one: Vec<GroupSummary>,
}

impl CaptureSnapshot {
    /// Summarize `log` using the thresholds in `config`.
    #[must_use]
    pub fn from_queries(log: &[CapturedQuery], config: &Config) -> Self {
        let summarize = |groups: IndexMap<String, Vec<&CapturedQuery>>| {
            groups
                .into_iter()
                .map(|(key, members)| GroupSummary::new(key, &members))
                .collect::<Vec<_>>()
        };

        let n_plus_one = n_plus_one_candidates(log, config.n_plus_one_threshold)
            .iter()
            .map(|candidate| {
                let members: Vec<&CapturedQuery> = candidate.queries.iter().collect();
                let key = format!("{} @ {}", candidate.shape, candidate.call_site_label());
                GroupSummary::new(key, &members)
            })
            .collect();

        Self {
            total: log.len(),
            total_time_ms: round_ms(total_duration(log)),
            failed: failed_queries(log).len(),
            per_type: group_by_type(log)
                .into_iter()
                .map(|(kind, members)| (kind, members.len()))
                .collect(),
            per_table: group_by_table(log)
                .into_iter()
                .map(|(table, members)| (table, members.len()))
                .collect(),
            duplicates: summarize(exact_duplicates(log)),
            similar: summarize(similar_queries(log)),
            slow_query_ms: config.slow_query_ms,
            slow_queries: slow_queries(log, config.slow_query_threshold())
                .into_iter()
                .map(|q| SlowQueryEntry {
                    sequence: q.sequence(),
                    sql: q.sql().to_string(),
                    query_type: q.query_type(),
                    tables: q.table_names().to_vec(),
                    duration_ms: round_ms(q.duration()),
                })
                .collect(),
            n_plus_one,
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> querylens_core::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Serialize to an indented JSON string.
    pub fn to_json_pretty(&self) -> querylens_core::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Round to milliseconds with 2 decimal places.
#[allow(clippy::cast_precision_loss)]
fn round_ms(duration: Duration) -> f64 {
    let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    let ms = us as f64 / 1000.0;
    (ms * 100.0).round() / 100.0
}
