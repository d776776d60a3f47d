//! Purpose: Time-paced synthetic source for live feeds.
//! Exports: `TickerSource`.
//! Role: Producer-paced counterpart to file sources; one chunk per tick, bounded lifetime.
//! Invariants: At most one chunk per tick; the first tick fires immediately.
//! Invariants: End of stream once `duration` has elapsed since construction.
//! Invariants: Missed ticks are delayed, never burst; dropping the source cancels its timer.
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::core::error::Error;
use crate::core::source::{Source, exhausted_error};

pub struct TickerSource<F> {
    interval: Interval,
    deadline: Instant,
    render: F,
    ticks: u64,
    finished: bool,
}

impl<F> TickerSource<F>
where
    F: FnMut(u64) -> Bytes + Send,
{
    /// `render` receives the 1-based tick number and returns that tick's chunk.
    pub fn new(period: Duration, duration: Duration, render: F) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            deadline: Instant::now() + duration,
            render,
            ticks: 0,
            finished: false,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

impl<F> Source for TickerSource<F>
where
    F: FnMut(u64) -> Bytes + Send,
{
    async fn produce(&mut self) -> Result<Option<Bytes>, Error> {
        if self.finished {
            return Err(exhausted_error());
        }
        tokio::select! {
            biased;
            () = tokio::time::sleep_until(self.deadline) => {
                self.finished = true;
                Ok(None)
            }
            _ = self.interval.tick() => {
                if Instant::now() >= self.deadline {
                    self.finished = true;
                    return Ok(None);
                }
                self.ticks += 1;
                Ok(Some((self.render)(self.ticks)))
            }
        }
    }

    fn abort(&mut self) {
        self.finished = true;
    }
}
