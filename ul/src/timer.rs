//! Stoppable deadlines for the Upper Layer.
//!
//! The same [`Timer`] type serves as the state machine's
//! response timer (ARTIM, PS3.8 section 9.1.5)
//! and as an association's idle timer.
use std::time::{Duration, Instant};
use tracing::trace;

/// A timer which expires a fixed amount of time after being started.
///
/// A timer without a timeout never expires,
/// and a stopped timer is never expired.
#[derive(Debug, Clone, PartialEq)]
pub struct Timer {
    timeout: Option<Duration>,
    started: Option<Instant>,
}

impl Timer {
    /// Create a new timer, initially stopped.
    pub fn new(timeout: Option<Duration>) -> Self {
        Timer {
            timeout,
            started: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Change the timeout of the timer.
    /// A running timer keeps its starting instant.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Start the timer.
    /// Starting a timer which is already running restarts it.
    pub fn start(&mut self) {
        trace!("timer started");
        self.started = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if self.started.take().is_some() {
            trace!("timer stopped");
        }
    }

    pub fn restart(&mut self) {
        self.stop();
        self.start();
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// Whether the timer is running and its timeout has elapsed.
    pub fn is_expired(&self) -> bool {
        match (self.started, self.timeout) {
            (Some(started), Some(timeout)) => started.elapsed() >= timeout,
            _ => false,
        }
    }

    /// The time left until expiry,
    /// or `None` if the timer cannot expire in its current state.
    pub fn remaining(&self) -> Option<Duration> {
        match (self.started, self.timeout) {
            (Some(started), Some(timeout)) => Some(timeout.saturating_sub(started.elapsed())),
            _ => None,
        }
    }
}
