use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::{LedWallError, Result};

/// Fixed-cadence pacing for loops that run on their own thread.
///
/// Deadlines advance by whole intervals. When a tick overruns its budget the
/// pacer skips ahead instead of trying to catch up with a burst of ticks.
#[derive(Debug, Clone)]
pub struct FramePacer {
    interval: Duration,
    next: Instant,
    overruns: u64,
}

/// Tick interval for `rate_hz`. Rates that are not positive, or so small
/// that the interval cannot be represented, are rejected.
pub fn tick_interval(rate_hz: f32) -> Result<Duration> {
    let invalid = || {
        LedWallError::invalid(format!(
            "tick rate must be a positive number of Hz, got {rate_hz}"
        ))
    };
    if !rate_hz.is_finite() || rate_hz <= 0.0 {
        return Err(invalid());
    }
    let interval = Duration::try_from_secs_f64(1.0 / rate_hz as f64).map_err(|_| invalid())?;
    // deadlines must stay representable for a few ticks ahead
    Instant::now()
        .checked_add(interval.saturating_mul(4))
        .ok_or_else(invalid)?;
    Ok(interval)
}

impl FramePacer {
    pub fn new(rate_hz: f32) -> Result<Self> {
        let interval = tick_interval(rate_hz)?;
        let next = Instant::now()
            .checked_add(interval)
            .ok_or_else(|| LedWallError::invalid(format!("tick rate {rate_hz} Hz is too small")))?;
        Ok(Self {
            interval,
            next,
            overruns: 0,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of ticks that started after their deadline had already passed.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Time left until the next deadline, zero when it has passed.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    /// Moves the deadline forward by one interval.
    pub fn advance(&mut self, now: Instant) {
        let base = if now > self.next {
            self.overruns += 1;
            now
        } else {
            self.next
        };
        self.next = base.checked_add(self.interval).unwrap_or(base);
    }

    /// Sleeps until the next deadline or until `stop` fires.
    ///
    /// Returns `false` once a stop message arrives or every stop sender has
    /// been dropped.
    pub fn wait_or_stop(&mut self, stop: &Receiver<()>) -> bool {
        let remaining = self.remaining(Instant::now());
        let keep_running = match stop.recv_timeout(remaining) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
            Err(RecvTimeoutError::Timeout) => true,
        };
        self.advance(Instant::now());
        keep_running
    }
}
