//! Call-site capture for recorded statements.
//!
//! Walks the current stack with the `backtrace` crate and keeps the frames
//! above the collector: the leading frames that belong to the unwinder, to
//! [`QueryCollector`](crate::QueryCollector) itself and to any caller-named
//! adapter prefixes are dropped, so the first kept frame is the code that
//! issued the statement.
//!
//! Resolution is best-effort. Stripped binaries yield fewer (or no) frames;
//! a capture never fails.

use querylens_core::StackFrame;

/// Symbol prefixes of leading frames that are never reported.
const INTERNAL_PREFIXES: [&str; 4] = [
    "backtrace::",
    concat!(module_path!(), "::capture_call_site"),
    concat!(module_path!(), "::walk"),
    crate::collector::COLLECTOR_FRAME_PREFIX,
];

/// Capture up to `max_frames` frames, innermost first.
///
/// Leading frames whose symbol path starts with one of `skip_prefixes` are
/// dropped along with the collector's own frames. Frames further out are kept
/// even when they match.
#[inline(never)]
#[must_use]
pub fn capture_call_site(max_frames: usize, skip_prefixes: &[String]) -> Vec<StackFrame> {
    if max_frames == 0 {
        return Vec::new();
    }
    walk(max_frames, skip_prefixes)
}

fn walk(max_frames: usize, skip_prefixes: &[String]) -> Vec<StackFrame> {
    let mut frames = Vec::with_capacity(max_frames.min(64));
    let mut skipping = true;

    backtrace::trace(|frame| {
        backtrace::resolve_frame(frame, |symbol| {
            if frames.len() >= max_frames {
                return;
            }
            let Some(name) = symbol.name() else {
                // Unresolvable frames carry no call-site information.
                return;
            };
            let function = format!("{name:#}");
            if skipping && (is_internal(&function) || matches_any(&function, skip_prefixes)) {
                return;
            }
            skipping = false;
            frames.push(StackFrame {
                function,
                file: symbol.filename().map(|p| p.display().to_string()),
                line: symbol.lineno(),
            });
        });
        frames.len() < max_frames
    });

    frames
}

fn is_internal(function: &str) -> bool {
    matches_any(function, &INTERNAL_PREFIXES)
}

fn matches_any<P: AsRef<str>>(function: &str, prefixes: &[P]) -> bool {
    // v0 symbols render inherent methods as `<path::Type>::method`.
    let path = function.trim_start_matches('<');
    prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_ref()))
}
