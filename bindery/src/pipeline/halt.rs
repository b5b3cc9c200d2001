//! Between-stage halt signal for a running pipeline.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    halted: AtomicBool,
    reason: RwLock<Option<String>>,
}

/// Requests that a run stop at the next stage boundary.
///
/// In-flight collaborator calls are never preempted: the controller only
/// consults the token between stages, so a halted run finishes its current
/// stage and then stops. Halting is idempotent; the first reason wins.
#[derive(Clone, Default)]
pub struct HaltToken {
    inner: Arc<Inner>,
}

impl HaltToken {
    /// Creates a fresh, un-halted token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a halt with a reason.
    pub fn halt(&self, reason: impl Into<String>) {
        if self
            .inner
            .halted
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.inner.reason.write() = Some(reason.into());
        }
    }

    /// Returns whether a halt has been requested.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    /// Returns the halt reason, if halted.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let token = HaltToken::new();
        assert!(!token.is_halted());

        token.halt("operator request");
        token.halt("second request");

        assert!(token.is_halted());
        assert_eq!(token.reason().as_deref(), Some("operator request"));
    }

    #[test]
    fn test_clones_share_state() {
        let token = HaltToken::new();
        let clone = token.clone();
        clone.halt("stop");
        assert!(token.is_halted());
    }
}
