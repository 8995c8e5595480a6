//! Per-request execution metadata: the deadline an engine's interrupt
//! handler polls against, plus the cancellation flag the pool uses to
//! signal an early abort (e.g. the client disconnected).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Created once per request, destroyed after the response is committed and
/// any `waitUntil` futures settle or the deadline passes.
#[derive(Clone)]
pub struct ExecutionContext {
    deadline: Instant,
    deadline_millis: f64,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionContext {
    /// Build an execution context with a deadline `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            deadline_millis: timeout.as_secs_f64() * 1000.0,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The host-clock instant at which execution must be interrupted.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Milliseconds remaining until the deadline, clamped to zero; handed to
    /// the sandbox as the budget backing its own timeout bookkeeping.
    pub fn deadline_millis(&self) -> f64 {
        self.deadline_millis
    }

    /// Signal an early abort — e.g. the inbound HTTP connection dropped
    /// before the deadline.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// True once either the deadline has passed or `cancel()` was called.
    /// Checked by the engine's interrupt handler on every JS opcode batch.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline || self.cancelled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_not_expired() {
        let ctx = ExecutionContext::with_timeout(Duration::from_secs(30));
        assert!(!ctx.is_expired());
    }

    #[test]
    fn cancel_marks_context_expired() {
        let ctx = ExecutionContext::with_timeout(Duration::from_secs(30));
        ctx.cancel();
        assert!(ctx.is_expired());
    }

    #[test]
    fn zero_timeout_is_immediately_expired() {
        let ctx = ExecutionContext::with_timeout(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(1));
        assert!(ctx.is_expired());
    }
}
