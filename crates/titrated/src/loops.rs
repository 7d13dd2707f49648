//! Tick scheduling and per-loop counters shared by the sampler and reporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{self, Duration};

use serde::Deserialize;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Granularity of the tokio timer wheel. Shorter periods need a [`BlockingTicker`].
pub const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// What a loop does when a tick overruns its period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TickPolicy {
    /// Fire late ticks back-to-back until the schedule catches up. No tick is dropped.
    #[default]
    Burst,
    /// Restart the schedule from the late tick.
    Delay,
    /// Drop missed ticks and resume on the next aligned deadline.
    Skip,
}

impl TickPolicy {
    fn missed_tick_behavior(self) -> MissedTickBehavior {
        match self {
            TickPolicy::Burst => MissedTickBehavior::Burst,
            TickPolicy::Delay => MissedTickBehavior::Delay,
            TickPolicy::Skip => MissedTickBehavior::Skip,
        }
    }

    /// Builds a ticker whose first tick fires one full period from now.
    pub fn interval(self, period: Duration) -> Interval {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(self.missed_tick_behavior());
        ticker
    }

    /// Deadline following one that fired at `now`.
    ///
    /// A tick less than one period late keeps the schedule for every policy.
    pub fn next_deadline(
        self,
        deadline: time::Instant,
        now: time::Instant,
        period: Duration,
    ) -> time::Instant {
        let late = now.saturating_duration_since(deadline);
        if period.is_zero() || late < period {
            return deadline + period;
        }
        match self {
            TickPolicy::Burst => deadline + period,
            TickPolicy::Delay => now + period,
            TickPolicy::Skip => {
                let into_period = late.as_nanos() % period.as_nanos();
                now + (period - Duration::from_nanos(into_period as u64))
            }
        }
    }
}

/// Thread-sleeping ticker for periods below [`TIMER_RESOLUTION`].
///
/// Sleeps to absolute deadlines, so oversleeping one tick shortens the
/// next gap instead of drifting the schedule.
#[derive(Debug)]
pub struct BlockingTicker {
    period: Duration,
    policy: TickPolicy,
    deadline: time::Instant,
}

impl BlockingTicker {
    /// First deadline is one full period from now.
    pub fn new(policy: TickPolicy, period: Duration) -> Self {
        Self {
            period,
            policy,
            deadline: time::Instant::now() + period,
        }
    }

    /// Blocks the calling thread until the next tick is due.
    pub fn wait(&mut self) {
        if let Some(remaining) = self.deadline.checked_duration_since(time::Instant::now()) {
            thread::sleep(remaining);
        }
        self.deadline = self
            .policy
            .next_deadline(self.deadline, time::Instant::now(), self.period);
    }
}

/// Counters a control loop bumps as it runs.
#[derive(Debug, Default)]
pub struct LoopCounters {
    ticks: AtomicU64,
    read_failures: AtomicU64,
    write_failures: AtomicU64,
    rows_emitted: AtomicU64,
}

impl LoopCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_row(&self) {
        self.rows_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            rows_emitted: self.rows_emitted.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`LoopCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub ticks: u64,
    pub read_failures: u64,
    pub write_failures: u64,
    pub rows_emitted: u64,
}
