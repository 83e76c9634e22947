//! Per-connection idle watchdog.

use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Fires once after `duration` passes without a [`reset`](IdleTimer::reset).
///
/// The timer is owned by the connection task and dropped with it.
#[derive(Debug)]
pub struct IdleTimer {
    duration: Duration,
    sleep: Pin<Box<Sleep>>,
    fired: bool,
}

impl IdleTimer {
    /// Start the watchdog. It runs from creation, before any byte arrives.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            sleep: Box::pin(tokio::time::sleep(duration)),
            fired: false,
        }
    }

    /// Record inbound activity.
    pub fn reset(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.duration);
    }

    /// Resolve when the connection has been idle for the full duration.
    ///
    /// Resolves at most once; later calls stay pending.
    pub async fn expired(&mut self) {
        if self.fired {
            return std::future::pending().await;
        }
        self.sleep.as_mut().await;
        self.fired = true;
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }
}
