//! Configuration management for querylens
//!
//! Configuration is loaded from `QUERYLENS_*` environment variables. Parsing is
//! lenient: missing or malformed values fall back to the defaults, and
//! [`Config::validate`] reports combinations that make no sense.

use std::collections::HashMap;
use std::env;

use crate::error::{Error, Result};

pub const ENV_CAPTURE_STACK: &str = "QUERYLENS_CAPTURE_STACK";
pub const ENV_STACK_DEPTH: &str = "QUERYLENS_STACK_DEPTH";
pub const ENV_SLOW_QUERY_MS: &str = "QUERYLENS_SLOW_QUERY_MS";
pub const ENV_N_PLUS_ONE_THRESHOLD: &str = "QUERYLENS_N_PLUS_ONE_THRESHOLD";
pub const ENV_LOG_SQL_MAX_CHARS: &str = "QUERYLENS_LOG_SQL_MAX_CHARS";
pub const ENV_IGNORE_FRAME_PREFIXES: &str = "QUERYLENS_IGNORE_FRAME_PREFIXES";

/// Collector and report configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Capture the call-site stack for every recorded statement.
    pub capture_stack: bool,
    /// Maximum number of frames kept per statement.
    pub stack_depth: usize,
    /// Statements at or above this duration are reported as slow.
    pub slow_query_ms: u64,
    /// Minimum repeats of one shape from one call site to flag an N+1 candidate.
    pub n_plus_one_threshold: usize,
    /// SQL text longer than this is truncated in log lines (not in the capture log).
    pub log_sql_max_chars: usize,
    /// Symbol path prefixes of driver-adapter frames to skip when locating the
    /// call site, e.g. `my_app::db::run_query`. Comma-separated in the env.
    pub ignore_frame_prefixes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture_stack: true,
            stack_depth: 32,
            slow_query_ms: 100,
            n_plus_one_threshold: 3,
            log_sql_max_chars: 200,
            ignore_frame_prefixes: Vec::new(),
        }
    }
}

impl Config {
    /// Build a config from the environment, starting from [`Config::default`].
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(env_value)
    }

    /// Build a config from the contents of a `KEY=value` env file.
    ///
    /// Variables set in the process environment take precedence over the file.
    #[must_use]
    pub fn from_env_file_contents(contents: &str) -> Self {
        let file_values = parse_env_lines(contents);
        Self::from_lookup(|key| env_value(key).or_else(|| file_values.get(key).cloned()))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            capture_stack: lookup_bool(&lookup, ENV_CAPTURE_STACK, defaults.capture_stack),
            stack_depth: lookup_parsed(&lookup, ENV_STACK_DEPTH, defaults.stack_depth),
            slow_query_ms: lookup_parsed(&lookup, ENV_SLOW_QUERY_MS, defaults.slow_query_ms),
            n_plus_one_threshold: lookup_parsed(
                &lookup,
                ENV_N_PLUS_ONE_THRESHOLD,
                defaults.n_plus_one_threshold,
            ),
            log_sql_max_chars: lookup_parsed(
                &lookup,
                ENV_LOG_SQL_MAX_CHARS,
                defaults.log_sql_max_chars,
            ),
            ignore_frame_prefixes: lookup(ENV_IGNORE_FRAME_PREFIXES)
                .map_or(defaults.ignore_frame_prefixes, |v| parse_list(&v)),
        }
    }

    /// Reject settings the collector cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.capture_stack && self.stack_depth == 0 {
            return Err(Error::invalid_config(
                ENV_STACK_DEPTH,
                self.stack_depth,
                "must be at least 1 while stack capture is enabled",
            ));
        }
        if self.n_plus_one_threshold < 2 {
            return Err(Error::invalid_config(
                ENV_N_PLUS_ONE_THRESHOLD,
                self.n_plus_one_threshold,
                "a repeated pattern needs at least 2 executions",
            ));
        }
        Ok(())
    }

    /// Slow-query threshold as a [`std::time::Duration`].
    #[must_use]
    pub const fn slow_query_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.slow_query_ms)
    }
}

#[cfg(test)]
thread_local! {
    static TEST_ENV_OVERRIDES: std::cell::RefCell<HashMap<String, String>> =
        std::cell::RefCell::new(HashMap::new());
}

#[cfg(test)]
fn test_env_override_value(key: &str) -> Option<String> {
    TEST_ENV_OVERRIDES.with(|cell| cell.borrow().get(key).cloned())
}

/// Read a value from the process environment.
#[must_use]
pub fn env_value(key: &str) -> Option<String> {
    #[cfg(test)]
    if let Some(v) = test_env_override_value(key) {
        return Some(v);
    }
    env::var(key).ok()
}

/// Parse `KEY=value` lines (e.g. an exported env file) into a map.
///
/// Blank lines, `#` comments and an optional `export ` prefix are tolerated.
/// Surrounding single or double quotes are stripped from values.
#[must_use]
pub fn parse_env_lines(contents: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        out.insert(key.to_string(), value.to_string());
    }
    out
}

fn parse_bool(value: &str, default: bool) -> bool {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => true,
        "0" | "false" | "f" | "no" | "n" | "off" => false,
        _ => default,
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn lookup_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key).map_or(default, |v| parse_bool(&v, default))
}

fn malformed<T: std::fmt::Display>(key: &str, value: &str, default: T) -> T {
    tracing::warn!(key, value, %default, "ignoring malformed config value");
    default
}

fn lookup_parsed<T: std::str::FromStr + std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .unwrap_or_else(|_| malformed(key, &raw, default)),
        None => default,
    }
}
