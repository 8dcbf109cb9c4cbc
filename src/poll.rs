//! Deadline-bounded polling.
//!
//! [`Deadline`] yields a finite sequence of ticks: the first immediately and
//! each later one after sleeping for the configured interval, clamped so the
//! last tick lands on the deadline. It never fails on its own; callers loop
//! over ticks, break out on success, and decide what exhausting the ticks
//! means for them.
//!
//! ```
//! # use std::time::Duration;
//! # use stackrun::poll::Deadline;
//! # async fn demo() {
//! let mut deadline = Deadline::new(Duration::from_secs(5), Duration::from_secs(1));
//! while let Some(_remaining) = deadline.tick().await {
//!     // check something, `break` or `return` on success
//! }
//! // exhausted: the caller raises its own timeout
//! # }
//! ```

use std::time::Duration;

use tokio::time::{Instant, sleep};

/// Bounded tick source used by every timed wait in the crate.
#[derive(Debug)]
pub struct Deadline {
    started: Instant,
    limit: Duration,
    interval: Duration,
    ticks: u32,
}

impl Deadline {
    /// Starts a deadline of `limit`, ticking every `interval`.
    ///
    /// A zero interval hands pacing to the caller: ticks are produced as
    /// fast as the caller asks for them until the deadline passes.
    #[must_use]
    pub fn new(limit: Duration, interval: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
            interval,
            ticks: 0,
        }
    }

    /// Maximum duration of the sequence.
    #[must_use]
    pub const fn limit(&self) -> Duration {
        self.limit
    }

    /// Time elapsed since the deadline started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    /// Number of ticks produced so far.
    #[must_use]
    pub const fn ticks(&self) -> u32 {
        self.ticks
    }

    /// Waits for the next tick and returns the time remaining, or `None`
    /// once the deadline has passed.
    pub async fn tick(&mut self) -> Option<Duration> {
        if self.ticks > 0 {
            let remaining = self.remaining();
            if remaining.is_zero() {
                return None;
            }
            if !self.interval.is_zero() {
                sleep(self.interval.min(remaining)).await;
            }
        }
        self.ticks = self.ticks.saturating_add(1);
        Some(self.remaining())
    }
}
