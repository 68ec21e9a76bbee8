//! Core types, configuration, and SQL heuristics for querylens
//!
//! This crate provides:
//! - Configuration management (`Config`, environment parsing)
//! - Captured statement records (`CapturedQuery`, `PendingQuery`)
//! - Statement classification and table extraction (`sql`)
//! - Statement shape normalization for similarity grouping (`shape`)
//! - Common error types

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod models;
pub mod shape;
pub mod sql;

// Re-export key types for convenience
pub use config::Config;
pub use error::{Error, Result};
pub use models::{
    CapturedError, CapturedQuery, PendingQuery, QueryOutcome, QueryStatus, QueryType, SqlValue,
    StackFrame,
};
pub use shape::normalize_shape;
pub use sql::{classify, extract_table_names, truncate_sql};
