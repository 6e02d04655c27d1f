//! Trailing debounce with a maximum wait.
//!
//! Each request pushes the deadline to `now + window`, but never past
//! `first_request + max_wait`, so a continuous stream of requests still
//! produces a recomputation at least every `max_wait`.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    max_wait: Duration,
    first_request: Option<Instant>,
    deadline: Option<Instant>,
}

impl Debouncer {
    /// `max_wait` is raised to `window` if shorter.
    pub fn new(window: Duration, max_wait: Duration) -> Self {
        Self {
            window,
            max_wait: max_wait.max(window),
            first_request: None,
            deadline: None,
        }
    }

    /// Fires on the first `take_due`.
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Request a recomputation.
    pub fn request(&mut self, now: Instant) {
        let first = *self.first_request.get_or_insert(now);
        let trailing = now + self.window;
        let cap = first + self.max_wait;
        self.deadline = Some(trailing.min(cap));
    }

    /// Deadline of the pending recomputation, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Consume the pending request if its deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Consume the pending request regardless of its deadline.
    pub fn take_pending(&mut self) -> bool {
        let pending = self.is_pending();
        self.reset();
        pending
    }

    pub fn reset(&mut self) {
        self.first_request = None;
        self.deadline = None;
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }
}
