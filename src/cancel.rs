//! Cooperative cancellation for in-flight requests.
//!
//! A [`CancellationToken`] is the only piece of state shared between the
//! caller's handle to a request, the executing task's I/O loops, and the
//! open-request registry. Cancellation is check-at-boundary: setting the
//! token does not tear down sockets, the executor observes it at the next
//! chunk boundary and unwinds itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared, thread-safe cancellation flag for one request.
///
/// Cloning produces another handle to the same flag. The token remains valid
/// after the request completes; further `cancel()` calls are no-ops.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flags the request as cancelled.
    ///
    /// Idempotent. Returns `true` only for the call that actually flipped
    /// the flag, which is how `cancel()` on the engine reports whether the
    /// handle was still live.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::SeqCst)
    }

    /// Returns whether cancellation has been requested.
    ///
    /// Lock-free; safe to poll from any thread.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns whether two tokens refer to the same underlying flag.
    #[must_use]
    pub fn same_token(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}
