//! Statement interception and the per-session capture log.
//!
//! [`QueryCollector`] sits in the host driver's execution chain. While
//! inactive it forwards every call untouched at the cost of one atomic load.
//! While active it records each call as a [`CapturedQuery`], whether the
//! wrapped executor returns `Ok`, returns `Err`, or panics, and then hands the
//! original result (or panic) back to the caller.
//!
//! ## Concurrency
//!
//! The collector is `Send + Sync`. The active flag is mirrored in an
//! `AtomicBool` for the fast path; the authoritative state lives behind one
//! mutex that is taken twice per recorded call (to reserve a sequence number,
//! then to append) and never held while the statement runs.
//!
//! - Log order is the order in which executions *began*: each record is
//!   inserted at the position its sequence number dictates.
//! - Sequence numbers increase for the collector's whole lifetime. A call still
//!   in flight when `start_collection` or `clear` runs is recorded in the new
//!   window, ahead of every statement that began after the reset.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use querylens_core::{
    CapturedError, CapturedQuery, Config, PendingQuery, QueryOutcome, QueryType, SqlValue,
    truncate_sql,
};

use crate::call_site::capture_call_site;
use crate::report::{self, CaptureSnapshot, NPlusOneCandidate};

/// Symbol prefix of collector frames, excluded from captured call sites.
pub(crate) const COLLECTOR_FRAME_PREFIX: &str = concat!(module_path!(), "::QueryCollector");

// =============================================================================
// StatementExecutor
// =============================================================================

/// The next step in a host driver's execution chain.
///
/// Implemented for every `FnOnce(&str, &[SqlValue], bool, C) -> Result<T, E>`,
/// so adapters usually pass a closure. `C` is the driver's opaque execution
/// context; the collector forwards it without looking at it.
pub trait StatementExecutor<C> {
    type Output;
    type Error;

    fn execute(
        self,
        sql: &str,
        params: &[SqlValue],
        batch: bool,
        context: C,
    ) -> Result<Self::Output, Self::Error>;
}

impl<C, F, T, E> StatementExecutor<C> for F
where
    F: FnOnce(&str, &[SqlValue], bool, C) -> Result<T, E>,
{
    type Output = T;
    type Error = E;

    fn execute(self, sql: &str, params: &[SqlValue], batch: bool, context: C) -> Result<T, E> {
        self(sql, params, batch, context)
    }
}

// =============================================================================
// QueryCollector
// =============================================================================

#[derive(Debug, Default)]
struct SessionState {
    active: bool,
    /// Never reset, so records that outlive a reset still sort by begin order.
    next_sequence: u64,
    log: Vec<CapturedQuery>,
}

/// Two-state statement recorder for one analysis session.
#[derive(Debug)]
pub struct QueryCollector {
    active: AtomicBool,
    state: Mutex<SessionState>,
    config: Config,
}

impl Default for QueryCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCollector {
    /// Create an inactive collector with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    /// Create an inactive collector with the given settings.
    #[must_use]
    pub fn with_config(config: &Config) -> Self {
        if let Err(error) = config.validate() {
            tracing::warn!(%error, "collector config failed validation");
        }
        Self {
            active: AtomicBool::new(false),
            state: Mutex::new(SessionState::default()),
            config: config.clone(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Session control ─────────────────────────────────────────────────

    /// Clear the log and start recording.
    pub fn start_collection(&self) {
        let mut state = self.lock_state();
        let discarded = state.log.len();
        state.log.clear();
        state.active = true;
        self.active.store(true, Ordering::Release);
        let first_sequence = state.next_sequence;
        drop(state);
        tracing::debug!(first_sequence, discarded, "query collection started");
    }

    /// Stop recording. The log is kept for analysis.
    pub fn stop_collection(&self) {
        let mut state = self.lock_state();
        let was_active = state.active;
        state.active = false;
        self.active.store(false, Ordering::Release);
        let captured = state.log.len();
        drop(state);
        if was_active {
            tracing::debug!(captured, "query collection stopped");
        }
    }

    /// Empty the log without changing whether collection is active.
    pub fn clear(&self) {
        let mut state = self.lock_state();
        let discarded = state.log.len();
        state.log.clear();
        drop(state);
        tracing::debug!(discarded, "query log cleared");
    }

    /// Whether statements are currently being recorded.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    // ── Interception hook ───────────────────────────────────────────────

    /// Run `next` for one statement, recording it if collection is active.
    ///
    /// The executor's result is returned unchanged, an error included, and a
    /// panic inside the executor resumes after the statement is recorded.
    pub fn execute<C, X>(
        &self,
        next: X,
        sql: &str,
        params: &[SqlValue],
        batch: bool,
        context: C,
    ) -> Result<X::Output, X::Error>
    where
        X: StatementExecutor<C>,
        X::Error: fmt::Display,
    {
        if !self.is_active() {
            return next.execute(sql, params, batch, context);
        }
        let Some(sequence) = self.reserve() else {
            return next.execute(sql, params, batch, context);
        };

        let stack_trace = if self.config.capture_stack {
            capture_call_site(self.config.stack_depth, &self.config.ignore_frame_prefixes)
        } else {
            Vec::new()
        };
        let pending = PendingQuery::begin(sequence, sql, params, batch, stack_trace);

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            next.execute(sql, params, batch, context)
        }));

        match result {
            Ok(Ok(output)) => {
                self.append(pending.finish(QueryOutcome::Success));
                Ok(output)
            }
            Ok(Err(error)) => {
                let captured = CapturedError::from_error(&error);
                self.append(pending.finish(QueryOutcome::Failure { error: captured }));
                Err(error)
            }
            Err(payload) => {
                let captured = CapturedError::from_panic(payload.as_ref());
                self.append(pending.finish(QueryOutcome::Failure { error: captured }));
                panic::resume_unwind(payload)
            }
        }
    }

    /// Re-check the authoritative flag and take the next sequence number.
    fn reserve(&self) -> Option<u64> {
        let mut state = self.lock_state();
        if !state.active {
            return None;
        }
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        Some(sequence)
    }

    /// Insert a finished record at its begin-order position.
    ///
    /// Every reserved call lands here exactly once, including calls that were
    /// in flight across `stop_collection`, `start_collection` or `clear`.
    fn append(&self, query: CapturedQuery) {
        let sequence = query.sequence();
        let sql = truncate_sql(query.sql(), self.config.log_sql_max_chars).into_owned();
        let failure = query.error().map(ToString::to_string);
        let duration_us = u64::try_from(query.duration().as_micros()).unwrap_or(u64::MAX);

        let mut state = self.lock_state();
        let position = state.log.partition_point(|q| q.sequence() < sequence);
        state.log.insert(position, query);
        drop(state);

        match failure {
            Some(error) => tracing::debug!(
                sequence,
                sql = %sql,
                error = %error,
                "captured failed statement"
            ),
            None => tracing::trace!(sequence, sql = %sql, duration_us, "captured statement"),
        }
    }

    // ── Log access ──────────────────────────────────────────────────────

    /// Clone of the current log, in execution-start order.
    #[must_use]
    pub fn queries(&self) -> Vec<CapturedQuery> {
        self.lock_state().log.clone()
    }

    /// Borrow the log under the lock without cloning it.
    ///
    /// Statements recorded by other threads wait until `f` returns, so keep
    /// `f` short and never execute statements through this collector from it.
    pub fn with_queries<R>(&self, f: impl FnOnce(&[CapturedQuery]) -> R) -> R {
        let state = self.lock_state();
        f(&state.log)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_state().log.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock_state().log.is_empty()
    }

    // ── Aggregations ────────────────────────────────────────────────────

    /// Sum of all recorded durations.
    #[must_use]
    pub fn total_duration(&self) -> Duration {
        self.with_queries(report::total_duration)
    }

    /// Number of recorded statements.
    #[must_use]
    pub fn query_count(&self) -> usize {
        self.len()
    }

    #[must_use]
    pub fn queries_by_type(&self) -> IndexMap<QueryType, Vec<CapturedQuery>> {
        self.with_queries(|log| report::owned_groups(report::group_by_type(log)))
    }

    #[must_use]
    pub fn queries_by_table(&self) -> IndexMap<String, Vec<CapturedQuery>> {
        self.with_queries(|log| report::owned_groups(report::group_by_table(log)))
    }

    /// Statements whose trimmed text occurs more than once.
    #[must_use]
    pub fn duplicate_queries(&self) -> IndexMap<String, Vec<CapturedQuery>> {
        self.with_queries(|log| report::owned_groups(report::exact_duplicates(log)))
    }

    /// Statements sharing a normalized shape, keyed by that shape.
    #[must_use]
    pub fn similar_queries(&self) -> IndexMap<String, Vec<CapturedQuery>> {
        self.with_queries(|log| report::owned_groups(report::similar_queries(log)))
    }

    /// Statements at or above the configured slow-query threshold.
    #[must_use]
    pub fn slow_queries(&self) -> Vec<CapturedQuery> {
        self.slow_queries_over(self.config.slow_query_threshold())
    }

    /// Statements that took at least `threshold`.
    #[must_use]
    pub fn slow_queries_over(&self, threshold: Duration) -> Vec<CapturedQuery> {
        self.with_queries(|log| {
            report::slow_queries(log, threshold)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    #[must_use]
    pub fn failed_queries(&self) -> Vec<CapturedQuery> {
        self.with_queries(|log| report::failed_queries(log).into_iter().cloned().collect())
    }

    /// Repeated shapes issued from one call site, at the configured threshold.
    #[must_use]
    pub fn n_plus_one_candidates(&self) -> Vec<NPlusOneCandidate> {
        self.n_plus_one_candidates_with(self.config.n_plus_one_threshold)
    }

    /// Repeated shapes issued from one call site at least `min_repeats` times.
    #[must_use]
    pub fn n_plus_one_candidates_with(&self, min_repeats: usize) -> Vec<NPlusOneCandidate> {
        self.with_queries(|log| report::n_plus_one_candidates(log, min_repeats))
    }

    /// Serializable summary of the current log.
    #[must_use]
    pub fn snapshot(&self) -> CaptureSnapshot {
        self.with_queries(|log| CaptureSnapshot::from_queries(log, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use querylens_core::QueryStatus;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, PartialEq, Eq)]
    struct DriverError(&'static str);

    impl fmt::Display for DriverError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "driver error: {}", self.0)
        }
    }

    type Outcome = Result<(), DriverError>;

    fn run(collector: &QueryCollector, sql: &str) -> Result<usize, DriverError> {
        collector.execute(
            |sql: &str, _: &[SqlValue], _: bool, (): ()| -> Result<usize, DriverError> {
                Ok(sql.len())
            },
            sql,
            &[],
            false,
            (),
        )
    }

    fn fail(collector: &QueryCollector, sql: &str) -> Result<usize, DriverError> {
        collector.execute(
            |_: &str, _: &[SqlValue], _: bool, (): ()| -> Result<usize, DriverError> {
                Err(DriverError("relation does not exist"))
            },
            sql,
            &[],
            false,
            (),
        )
    }

    #[test]
    fn inactive_collector_forwards_without_recording() {
        let collector = QueryCollector::new();
        assert!(!collector.is_active());
        for _ in 0..5 {
            assert_eq!(run(&collector, "SELECT 1"), Ok(8));
        }
        assert!(collector.is_empty());
        assert_eq!(fail(&collector, "SELECT 1"), Err(DriverError("relation does not exist")));
        assert_eq!(collector.len(), 0);
    }

    #[test]
    fn active_collector_records_every_call() {
        let collector = QueryCollector::new();
        collector.start_collection();
        for i in 0..4 {
            run(&collector, &format!("SELECT * FROM t WHERE id = {i}")).unwrap();
        }
        assert_eq!(collector.query_count(), 4);
        let sequences: Vec<u64> = collector
            .queries()
            .iter()
            .map(CapturedQuery::sequence)
            .collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
    }

    #[test]
    fn executor_receives_arguments_and_context_unchanged() {
        let collector = QueryCollector::new();
        collector.start_collection();
        let mut seen_context = 0_u32;
        let params = [SqlValue::Int(7), SqlValue::from("x")];
        let out = collector.execute(
            |sql: &str, p: &[SqlValue], batch: bool, ctx: &mut u32| -> Result<String, DriverError> {
                *ctx += 1;
                Ok(format!("{sql}|{}|{batch}", p.len()))
            },
            "INSERT INTO t VALUES (%s, %s)",
            &params,
            true,
            &mut seen_context,
        );
        assert_eq!(out.unwrap(), "INSERT INTO t VALUES (%s, %s)|2|true");
        assert_eq!(seen_context, 1);

        let log = collector.queries();
        assert_eq!(log[0].params(), params);
        assert!(log[0].batch());
        assert_eq!(log[0].query_type(), QueryType::Insert);
        assert_eq!(log[0].table_names(), ["t"]);
    }

    #[test]
    fn errors_are_recorded_then_returned() {
        let collector = QueryCollector::new();
        collector.start_collection();
        let err = fail(&collector, "SELECT * FROM missing").unwrap_err();
        assert_eq!(err, DriverError("relation does not exist"));

        let log = collector.queries();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status(), QueryStatus::Error);
        let captured = log[0].error().expect("captured error");
        assert_eq!(captured.message, "driver error: relation does not exist");
        assert!(captured.type_name.ends_with("DriverError"));
        assert!(!captured.panicked);
    }

    #[test]
    fn panics_are_recorded_then_resumed() {
        let collector = QueryCollector::new();
        collector.start_collection();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            collector.execute(
                |_: &str, _: &[SqlValue], _: bool, (): ()| -> Outcome {
                    panic!("connection reset")
                },
                "SELECT 1",
                &[],
                false,
                (),
            )
        }));
        let payload = outcome.expect_err("panic must propagate");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"connection reset"));

        let log = collector.queries();
        assert_eq!(log.len(), 1);
        let captured = log[0].error().expect("captured panic");
        assert!(captured.panicked);
        assert_eq!(captured.message, "connection reset");
    }

    #[test]
    fn start_is_idempotent_and_clears() {
        let collector = QueryCollector::new();
        collector.start_collection();
        run(&collector, "SELECT 1").unwrap();
        collector.start_collection();
        assert!(collector.is_active());
        assert!(collector.is_empty());
        collector.start_collection();
        assert!(collector.is_active());
        assert!(collector.is_empty());
        run(&collector, "SELECT 2").unwrap();
        let log = collector.queries();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].sql(), "SELECT 2");
    }

    #[test]
    fn stop_keeps_log_and_is_idempotent() {
        let collector = QueryCollector::new();
        collector.stop_collection();
        assert!(!collector.is_active());
        collector.start_collection();
        run(&collector, "SELECT 1").unwrap();
        collector.stop_collection();
        collector.stop_collection();
        assert!(!collector.is_active());
        assert_eq!(collector.len(), 1);
        run(&collector, "SELECT 2").unwrap();
        assert_eq!(collector.len(), 1);
    }

    #[test]
    fn clear_keeps_activation_state() {
        let collector = QueryCollector::new();
        collector.start_collection();
        run(&collector, "SELECT 1").unwrap();
        collector.clear();
        assert!(collector.is_active());
        assert!(collector.is_empty());
        run(&collector, "SELECT 2").unwrap();
        assert_eq!(collector.len(), 1);

        collector.stop_collection();
        collector.clear();
        collector.clear();
        assert!(!collector.is_active());
        assert!(collector.is_empty());
    }

    #[test]
    fn statement_in_flight_across_restart_is_recorded() {
        let collector = QueryCollector::new();
        collector.start_collection();
        collector
            .execute(
                |_: &str, _: &[SqlValue], _: bool, c: &QueryCollector| -> Outcome {
                    c.start_collection();
                    run(c, "SELECT after_restart").map(|_| ())
                },
                "SELECT before_restart",
                &[],
                false,
                &collector,
            )
            .unwrap();
        assert!(collector.is_active());
        let log = collector.queries();
        let sql: Vec<&str> = log.iter().map(CapturedQuery::sql).collect();
        assert_eq!(sql, ["SELECT before_restart", "SELECT after_restart"]);
    }

    #[test]
    fn failure_in_flight_across_clear_is_recorded() {
        let collector = QueryCollector::new();
        collector.start_collection();
        run(&collector, "SELECT discarded").unwrap();
        let err = collector
            .execute(
                |_: &str, _: &[SqlValue], _: bool, c: &QueryCollector| -> Outcome {
                    c.clear();
                    Err(DriverError("deadlock detected"))
                },
                "UPDATE t SET v = 1",
                &[],
                false,
                &collector,
            )
            .unwrap_err();
        assert_eq!(err, DriverError("deadlock detected"));

        assert_eq!(collector.len(), 1);
        let failed = collector.failed_queries();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].sql(), "UPDATE t SET v = 1");
    }

    #[test]
    fn statement_in_flight_across_stop_is_recorded() {
        let collector = QueryCollector::new();
        collector.start_collection();
        collector
            .execute(
                |_: &str, _: &[SqlValue], _: bool, c: &QueryCollector| -> Outcome {
                    c.stop_collection();
                    Ok(())
                },
                "SELECT 1",
                &[],
                false,
                &collector,
            )
            .unwrap();
        assert!(!collector.is_active());
        assert_eq!(collector.len(), 1);
    }

    #[test]
    fn nested_statements_keep_begin_order() {
        let collector = QueryCollector::new();
        collector.start_collection();
        collector
            .execute(
                |_: &str, _: &[SqlValue], _: bool, c: &QueryCollector| -> Outcome {
                    // An executor that issues its own statement finishes after it.
                    run(c, "SELECT inner_work").map(|_| ())
                },
                "SELECT outer_work",
                &[],
                false,
                &collector,
            )
            .unwrap();
        let log = collector.queries();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].sql(), "SELECT outer_work");
        assert_eq!(log[1].sql(), "SELECT inner_work");
    }

    #[test]
    fn call_site_excludes_collector_frames() {
        let collector = QueryCollector::new();
        collector.start_collection();
        run(&collector, "SELECT 1").unwrap();
        let log = collector.queries();
        let frames = log[0].stack_trace();
        assert!(
            frames
                .iter()
                .all(|f| !f.function.starts_with(COLLECTOR_FRAME_PREFIX)
                    && !f.function.starts_with("backtrace::")),
            "collector frames leaked: {frames:#?}"
        );
        assert!(frames.len() <= collector.config().stack_depth);
    }

    #[test]
    fn stack_capture_can_be_disabled() {
        let config = Config {
            capture_stack: false,
            ..Config::default()
        };
        let collector = QueryCollector::with_config(&config);
        collector.start_collection();
        run(&collector, "SELECT 1").unwrap();
        assert!(collector.queries()[0].stack_trace().is_empty());
    }

    fn count_execution(collector: &QueryCollector, sql: &str, executed: &AtomicUsize) -> Outcome {
        collector.execute(
            |_: &str, _: &[SqlValue], _: bool, n: &AtomicUsize| -> Outcome {
                n.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            sql,
            &[],
            false,
            executed,
        )
    }

    #[test]
    fn concurrent_statements_are_all_recorded() {
        let collector = Arc::new(QueryCollector::new());
        collector.start_collection();
        let executed = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let collector = Arc::clone(&collector);
                let executed = Arc::clone(&executed);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let sql = format!("SELECT * FROM t{t} WHERE id = {i}");
                        count_execution(&collector, &sql, &executed).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker panicked");
        }

        assert_eq!(executed.load(Ordering::Relaxed), 400);
        let sequences: Vec<u64> = collector
            .queries()
            .iter()
            .map(CapturedQuery::sequence)
            .collect();
        let expected: Vec<u64> = (0..400).collect();
        assert_eq!(sequences, expected);
    }
}
