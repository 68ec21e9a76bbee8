//! Statement capture and N+1 diagnostics for querylens
//!
//! This crate provides:
//! - `QueryCollector`, an interception hook for a host driver's execution chain
//! - Call-site capture for recorded statements
//! - Read-only aggregations over the capture log and a serializable snapshot
//!
//! # Example
//!
//! ```
//! use querylens_capture::{QueryCollector, SqlValue};
//!
//! let collector = QueryCollector::new();
//! collector.start_collection();
//!
//! for id in 1..=3_i64 {
//!     let rows = collector.execute(
//!         |_: &str, _: &[SqlValue], _: bool, (): ()| -> Result<usize, std::io::Error> {
//!             Ok(1)
//!         },
//!         &format!("SELECT * FROM orders WHERE id = {id}"),
//!         &[],
//!         false,
//!         (),
//!     );
//!     assert_eq!(rows.unwrap(), 1);
//! }
//!
//! collector.stop_collection();
//! assert_eq!(collector.query_count(), 3);
//! assert_eq!(collector.similar_queries().len(), 1);
//! ```

#![forbid(unsafe_code)]

pub mod call_site;
pub mod collector;
pub mod report;

pub use call_site::capture_call_site;
pub use collector::{QueryCollector, StatementExecutor};
pub use report::{CaptureSnapshot, GroupSummary, NPlusOneCandidate, SlowQueryEntry};

// Re-export the record types so adapters only need this crate.
pub use querylens_core::{
    CapturedError, CapturedQuery, Config, QueryOutcome, QueryStatus, QueryType, SqlValue,
    StackFrame,
};
