//! Throttled, cancellation-aware delivery of request snapshots.
//!
//! A [`CallbackChannel`] sits between the executing task and the host's
//! listener. Deliveries are evaluated in a fixed order: unregistered
//! listeners, missing delivery contexts, and cancelled requests reject
//! outright; same-phase snapshots inside the throttle window reject unless
//! the delivery is marked terminal. Accepted snapshots are posted into the
//! host-owned [`DeliveryContext`] and run asynchronously — delivery never
//! blocks the I/O loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::collab::DeliveryContext;
use crate::state::{Phase, RequestEvent, RequestState};

/// Minimum interval between accepted same-phase deliveries for one request.
pub const THROTTLE_WINDOW: Duration = Duration::from_millis(1000);

/// Receives request-state snapshots on the delivery context.
pub trait RequestListener: Send {
    /// Handles one delivered snapshot.
    fn on_event(&mut self, event: RequestEvent);
}

impl<F> RequestListener for F
where
    F: FnMut(RequestEvent) + Send,
{
    fn on_event(&mut self, event: RequestEvent) {
        self(event);
    }
}

type ListenerSlot = Arc<Mutex<Option<Box<dyn RequestListener>>>>;

#[derive(Debug, Default)]
struct Throttle {
    last_phase: Option<Phase>,
    last_at: Option<Instant>,
}

/// Rate-limited, cancellation-aware snapshot delivery for one request.
pub struct CallbackChannel {
    token: CancellationToken,
    context: Option<Arc<dyn DeliveryContext>>,
    listener: ListenerSlot,
    throttle: Mutex<Throttle>,
    throttle_window: Duration,
}

impl CallbackChannel {
    /// Creates a channel for one request.
    ///
    /// A request may legitimately run without a listener or without a
    /// context (the host's runtime may already be gone); deliveries then
    /// become no-ops.
    #[must_use]
    pub fn new(
        listener: Option<Box<dyn RequestListener>>,
        context: Option<Arc<dyn DeliveryContext>>,
        token: CancellationToken,
    ) -> Self {
        Self {
            token,
            context,
            listener: Arc::new(Mutex::new(listener)),
            throttle: Mutex::new(Throttle::default()),
            throttle_window: THROTTLE_WINDOW,
        }
    }

    /// Overrides the throttle window so tests need not wait out a second.
    #[cfg(test)]
    pub(crate) fn set_throttle_window(&mut self, window: Duration) {
        self.throttle_window = window;
    }

    /// Whether a listener is still registered.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drops the listener; subsequent deliveries are rejected.
    pub fn unregister(&self) {
        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Offers a snapshot for delivery. Returns whether it was accepted.
    ///
    /// Terminal deliveries (`is_final`) bypass the throttle and unregister
    /// the listener: after the listener body runs when the delivery was
    /// accepted, or immediately when it could not be posted at all.
    pub fn deliver(&self, state: &RequestState, is_final: bool) -> bool {
        if !self.is_registered() {
            debug!("delivery after listener was unregistered, ignoring");
            return false;
        }

        let Some(context) = self.context.as_ref() else {
            debug!("delivery without a bound delivery context, ignoring");
            if is_final {
                self.unregister();
            }
            return false;
        };

        // Cancellation silences all further delivery, including a terminal
        // snapshot for a request cancelled mid-flight.
        if self.token.is_cancelled() {
            debug!("delivery after cancellation, ignoring");
            if is_final {
                self.unregister();
            }
            return false;
        }

        {
            let mut throttle = self
                .throttle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let same_phase = throttle.last_phase == Some(state.phase);
            let inside_window = throttle
                .last_at
                .is_some_and(|at| at.elapsed() < self.throttle_window);
            if !is_final && same_phase && inside_window {
                debug!(
                    phase = state.phase.as_str(),
                    "delivery within throttle window for same phase, ignoring"
                );
                return false;
            }
            throttle.last_phase = Some(state.phase);
            throttle.last_at = Some(Instant::now());
        }

        let event = state.snapshot(&self.token);
        let listener = Arc::clone(&self.listener);
        let token = self.token.clone();
        context.post(Box::new(move || {
            run_delivery(&listener, &token, event, is_final);
        }));
        true
    }
}

/// Runs one posted delivery on the context thread.
///
/// Cancellation and registration are re-checked here: the request may have
/// been cancelled between posting and execution. Listener panics are caught
/// and logged; they never abort the delivery context.
fn run_delivery(
    listener: &ListenerSlot,
    token: &CancellationToken,
    event: RequestEvent,
    is_final: bool,
) {
    if token.is_cancelled() {
        debug!("delivery posted before cancellation arrived after it, ignoring");
        return;
    }

    let mut slot = listener.lock().unwrap_or_else(PoisonError::into_inner);
    let Some(active) = slot.as_mut() else {
        debug!("delivery arrived after listener was unregistered, ignoring");
        return;
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| active.on_event(event)));
    if let Err(panic) = outcome {
        let message = panic
            .downcast_ref::<&str>()
            .map(std::string::ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        warn!(error = %message, "listener panicked during delivery");
    }

    if is_final {
        *slot = None;
    }
}
