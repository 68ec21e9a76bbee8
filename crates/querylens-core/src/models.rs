//! Captured statement records.
//!
//! A [`CapturedQuery`] is built in two steps: [`PendingQuery::begin`] takes
//! everything known before the statement runs (text, parameters, call site,
//! classification, start time), and [`PendingQuery::finish`] stamps the
//! elapsed duration and outcome. Once finished a record is never mutated.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shape::normalize_shape;
use crate::sql::{classify, extract_table_names};

// =============================================================================
// QueryType
// =============================================================================

/// Statement classification by leading keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Other,
}

impl QueryType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Create => "CREATE",
            Self::Drop => "DROP",
            Self::Alter => "ALTER",
            Self::Other => "OTHER",
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// SqlValue
// =============================================================================

/// A bound positional parameter, copied verbatim from the driver call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<Self>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

// =============================================================================
// StackFrame
// =============================================================================

/// One call-site frame: enclosing function plus source location when known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{file}:{line} in {}", self.function),
            (Some(file), None) => write!(f, "{file} in {}", self.function),
            _ => f.write_str(&self.function),
        }
    }
}

// =============================================================================
// Outcome
// =============================================================================

/// Description of a failed execution, detached from the original error value
/// (which goes back to the caller unchanged).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedError {
    /// Rust type name of the error (`"<panic>"` for panics).
    pub type_name: String,
    pub message: String,
    /// The executor unwound instead of returning `Err`.
    pub panicked: bool,
}

impl CapturedError {
    /// Describe an error value returned by the wrapped executor.
    #[must_use]
    pub fn from_error<E: fmt::Display>(error: &E) -> Self {
        Self {
            type_name: std::any::type_name::<E>().to_string(),
            message: error.to_string(),
            panicked: false,
        }
    }

    /// Describe a panic payload caught around the wrapped executor.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "executor panicked".to_string());
        Self {
            type_name: "<panic>".to_string(),
            message,
            panicked: true,
        }
    }
}

impl fmt::Display for CapturedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// How the wrapped execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum QueryOutcome {
    #[serde(rename = "ok")]
    Success,
    #[serde(rename = "error")]
    Failure { error: CapturedError },
}

/// Flat view of [`QueryOutcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Ok,
    Error,
}

impl QueryStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CapturedQuery
// =============================================================================

/// One executed statement and its outcome.
#[derive(Debug, Clone, Serialize)]
pub struct CapturedQuery {
    sequence: u64,
    sql: String,
    params: Vec<SqlValue>,
    batch: bool,
    duration: Duration,
    timestamp: DateTime<Utc>,
    stack_trace: Vec<StackFrame>,
    query_type: QueryType,
    table_names: Vec<String>,
    outcome: QueryOutcome,
}

impl CapturedQuery {
    /// Begin-order number, monotonic for the collector's lifetime.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Raw statement text exactly as passed to the driver.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    /// Whether the driver executed this as a batch (`executemany`).
    #[must_use]
    pub const fn batch(&self) -> bool {
        self.batch
    }

    #[must_use]
    pub const fn duration(&self) -> Duration {
        self.duration
    }

    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Call-site frames, innermost first.
    #[must_use]
    pub fn stack_trace(&self) -> &[StackFrame] {
        &self.stack_trace
    }

    #[must_use]
    pub const fn query_type(&self) -> QueryType {
        self.query_type
    }

    #[must_use]
    pub fn table_names(&self) -> &[String] {
        &self.table_names
    }

    #[must_use]
    pub const fn outcome(&self) -> &QueryOutcome {
        &self.outcome
    }

    #[must_use]
    pub const fn status(&self) -> QueryStatus {
        match self.outcome {
            QueryOutcome::Success => QueryStatus::Ok,
            QueryOutcome::Failure { .. } => QueryStatus::Error,
        }
    }

    /// The captured failure, present only when [`status`](Self::status) is `Error`.
    #[must_use]
    pub const fn error(&self) -> Option<&CapturedError> {
        match &self.outcome {
            QueryOutcome::Success => None,
            QueryOutcome::Failure { error } => Some(error),
        }
    }

    /// Whitespace- and literal-normalized SQL used for similarity grouping.
    #[must_use]
    pub fn shape(&self) -> String {
        normalize_shape(&self.sql)
    }

    /// Innermost captured frame, if any.
    #[must_use]
    pub fn call_site(&self) -> Option<&StackFrame> {
        self.stack_trace.first()
    }
}

/// A statement whose execution has started but not yet finished.
#[derive(Debug)]
pub struct PendingQuery {
    sequence: u64,
    sql: String,
    params: Vec<SqlValue>,
    batch: bool,
    started: Instant,
    timestamp: DateTime<Utc>,
    stack_trace: Vec<StackFrame>,
    query_type: QueryType,
    table_names: Vec<String>,
}

impl PendingQuery {
    /// Classify the statement and start the clock.
    ///
    /// Call immediately before invoking the executor: the monotonic start
    /// instant and the wall-clock timestamp are taken here.
    #[must_use]
    pub fn begin(
        sequence: u64,
        sql: &str,
        params: &[SqlValue],
        batch: bool,
        stack_trace: Vec<StackFrame>,
    ) -> Self {
        let query_type = classify(sql);
        let table_names = extract_table_names(sql);
        Self {
            sequence,
            sql: sql.to_string(),
            params: params.to_vec(),
            batch,
            timestamp: Utc::now(),
            started: Instant::now(),
            stack_trace,
            query_type,
            table_names,
        }
    }

    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Stop the clock and seal the record.
    #[must_use]
    pub fn finish(self, outcome: QueryOutcome) -> CapturedQuery {
        let duration = self.started.elapsed();
        self.finish_with_duration(outcome, duration)
    }

    /// Seal the record with a duration measured by the caller.
    #[must_use]
    pub fn finish_with_duration(self, outcome: QueryOutcome, duration: Duration) -> CapturedQuery {
        CapturedQuery {
            duration,
            sequence: self.sequence,
            sql: self.sql,
            params: self.params,
            batch: self.batch,
            timestamp: self.timestamp,
            stack_trace: self.stack_trace,
            query_type: self.query_type,
            table_names: self.table_names,
            outcome,
        }
    }
}
