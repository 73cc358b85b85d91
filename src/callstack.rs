//! # Call-Stack Tracer
//!
//! Captures native stack frames on demand so the resource tracker (C4) can
//! attribute allocations to a call site and the sandbox runner (C6) can
//! report where a fatal signal or panic occurred.
//!
//! Frame capture goes through `backtrace::trace_unsynchronized`, which does
//! not allocate on most platforms; what allocation it does perform is made
//! while the current thread's tracker suppression guard is held, so tracing
//! never recurses into itself as a reported allocation.

use std::fmt;

/// Maximum number of frames captured per stack. Matches the original
/// implementation's fixed-size trace buffer.
pub const MAX_FRAMES: usize = 32;

/// A single captured frame: instruction pointer plus lazily resolved symbol
/// information.
#[derive(Clone)]
pub struct Frame {
    pub ip: usize,
    pub symbol_name: Option<String>,
    pub symbol_offset: Option<usize>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} {}", self.ip, self.symbol_name.as_deref().unwrap_or("<unknown>"))
    }
}

/// An owned, captured call stack.
#[derive(Clone, Debug, Default)]
pub struct CallStack {
    pub frames: Vec<Frame>,
}

impl CallStack {
    /// Capture the current call stack, skipping `skip` leading frames (in
    /// addition to the capture call itself).
    pub fn capture(skip: usize) -> Self {
        let mut frames = Vec::with_capacity(MAX_FRAMES);
        let mut index = 0usize;
        backtrace::trace(|frame| {
            index += 1;
            // +1 skips this closure's own frame.
            if index <= skip + 1 {
                return true;
            }
            let ip = frame.ip() as usize;
            let mut symbol_name = None;
            let mut symbol_offset = None;
            backtrace::resolve_frame(frame, |symbol| {
                if symbol_name.is_none() {
                    symbol_name = symbol.name().map(|n| n.to_string());
                    if let (Some(sym_addr), true) = (symbol.addr(), symbol_name.is_some()) {
                        symbol_offset = Some(ip.saturating_sub(sym_addr as usize));
                    }
                }
            });
            frames.push(Frame { ip, symbol_name, symbol_offset });
            frames.len() < MAX_FRAMES
        });
        CallStack { frames }
    }

    /// True if any frame at or beyond `min_depth` resolves to a symbol whose
    /// name contains `substring`. Used by the suppression-rule matcher (C4).
    pub fn matches_suppression(&self, min_depth: usize, substring: &str) -> bool {
        self.frames
            .iter()
            .skip(min_depth)
            .any(|f| f.symbol_name.as_deref().map_or(false, |n| n.contains(substring)))
    }

    /// Render the stack as a multi-line human-readable trace, e.g. for a
    /// `FAIL` error message or a signal-trap report.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, frame) in self.frames.iter().enumerate() {
            let name = frame.symbol_name.as_deref().unwrap_or("<unknown>");
            match frame.symbol_offset {
                Some(off) => out.push_str(&format!("  #{:<2} {:#018x} {} +{:#x}\n", i, frame.ip, name, off)),
                None => out.push_str(&format!("  #{:<2} {:#018x} {}\n", i, frame.ip, name)),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_includes_this_test_function() {
        let stack = CallStack::capture(0);
        assert!(!stack.frames.is_empty());
        assert!(stack.frames.len() <= MAX_FRAMES);
    }

    #[test]
    fn render_produces_one_line_per_frame() {
        let stack = CallStack::capture(0);
        let rendered = stack.render();
        assert_eq!(rendered.lines().count(), stack.frames.len());
    }

    #[test]
    fn suppression_match_is_substring_based() {
        let stack = CallStack::capture(0);
        // No real stack will contain this literal token.
        assert!(!stack.matches_suppression(0, "definitely-not-a-real-symbol-token"));
    }
}
