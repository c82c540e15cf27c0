//! Tracking of in-flight requests for cancellation.
//!
//! Every submitted request is entered here for the duration of its run; its
//! cancellation token doubles as the caller's handle. The registry only sets
//! cancellation flags, it never joins or aborts tasks: each executor notices
//! the flag at its next chunk boundary and winds itself down.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::cancel::CancellationToken;

/// The set of currently executing requests.
#[derive(Debug, Default)]
pub struct OpenRequestRegistry {
    entries: DashMap<u64, CancellationToken>,
    next_id: AtomicU64,
}

impl OpenRequestRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a request's token and returns its registry id.
    pub fn add(&self, token: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(id, token);
        debug!(request = id, open = self.entries.len(), "request registered");
        id
    }

    /// Removes a finished request. Idempotent.
    pub fn remove(&self, id: u64) {
        self.entries.remove(&id);
        debug!(request = id, open = self.entries.len(), "request removed");
    }

    /// Sets the cancellation flag on every open request and forgets them.
    ///
    /// The executors unwind on their own; nothing blocks here.
    pub fn abort_all(&self) {
        for entry in &self.entries {
            entry.value().cancel();
        }
        self.entries.clear();
    }

    /// Number of requests currently open.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no requests are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
