//! Diagnostic channel helpers.
//!
//! Diagnostics are emitted through `tracing`. Two policies apply to messages
//! produced on the audio path:
//! - [`truncate`]: messages are bounded to [`MAX_MESSAGE_LEN`] bytes; longer
//!   messages are cut at a UTF-8 boundary instead of being rejected.
//! - [`LogBudget`]: a per-kind counter that lets the first few occurrences
//!   through and suppresses the rest, so a failing guest cannot saturate the
//!   log from inside a real-time loop.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tracing::debug;

/// Maximum length of a diagnostic message in bytes.
pub const MAX_MESSAGE_LEN: usize = 256;

/// Bound `message` to [`MAX_MESSAGE_LEN`] bytes.
pub fn truncate(message: &str) -> &str {
    if message.len() <= MAX_MESSAGE_LEN {
        return message;
    }
    let mut end = MAX_MESSAGE_LEN;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

/// A countdown of how many more times a diagnostic may be emitted.
#[derive(Debug)]
pub struct LogBudget {
    remaining: AtomicU32,
    suppressed: AtomicU64,
}

impl LogBudget {
    /// Create a budget that allows `limit` emissions.
    pub const fn new(limit: u32) -> Self {
        Self {
            remaining: AtomicU32::new(limit),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Consume one emission. Returns `false` once the budget is spent.
    pub fn allow(&self) -> bool {
        let granted = self
            .remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        if !granted && self.suppressed.fetch_add(1, Ordering::Relaxed) == 0 {
            debug!("Diagnostic budget spent, suppressing further messages");
        }
        granted
    }

    /// Number of emissions refused so far.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}
