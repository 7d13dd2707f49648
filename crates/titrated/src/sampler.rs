//! Sampler Engine.
//!
//! High-frequency loop: read occupancy, push it into the window, average,
//! publish the averages and feed the chosen one back to the datapath. Within
//! a tick these steps run in that order and nothing else writes the window
//! or the published averages.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use titrate_common::SamplerMaps;

use crate::loops::{BlockingTicker, CountersSnapshot, LoopCounters, TickPolicy, TIMER_RESOLUTION};
use crate::policy::Policy;
use crate::stats::{Averages, SharedStats};
use crate::window::SampleWindow;

/// Owns the sample window and the sampler's view of the kernel records.
pub struct Sampler {
    maps: SamplerMaps,
    window: SampleWindow,
    policy: Policy,
    stats: Arc<SharedStats>,
    counters: Arc<LoopCounters>,
}

impl Sampler {
    pub fn new(
        maps: SamplerMaps,
        capacity: usize,
        policy: Policy,
        stats: Arc<SharedStats>,
    ) -> Self {
        Self {
            maps,
            window: SampleWindow::new(capacity),
            policy,
            stats,
            counters: Arc::new(LoopCounters::new()),
        }
    }

    /// Handle to this loop's counters.
    pub fn counters(&self) -> Arc<LoopCounters> {
        Arc::clone(&self.counters)
    }

    pub fn window(&self) -> &SampleWindow {
        &self.window
    }

    /// Runs one sampling step.
    ///
    /// A failed buffer read skips the tick and leaves the window untouched.
    /// A failed feedback write is logged; the averages are still published.
    /// Returns the averages computed this tick, if any.
    pub fn tick(&mut self) -> Option<Averages> {
        self.counters.record_tick();

        let state = match self.maps.read_buffer_state() {
            Ok(state) => state,
            Err(e) => {
                self.counters.record_read_failure();
                warn!(error = %e, "Sampler: skipping tick");
                return None;
            }
        };

        self.window.push(state.current_buffer_bits);
        let averages = self.policy.averages(&self.window);
        self.stats.publish(averages);

        if let Err(e) = self.maps.write_avg_queue(averages.feedback()) {
            self.counters.record_write_failure();
            warn!(error = %e, "Sampler: feedback write failed");
        }

        trace!(
            sample_bits = state.current_buffer_bits,
            simple_avg = averages.simple,
            filtered_avg = ?averages.filtered,
            "Sampler tick"
        );
        Some(averages)
    }

    /// Ticks every `period` until `cancel` fires.
    ///
    /// Periods below [`TIMER_RESOLUTION`] run on a blocking thread that
    /// sleeps to each deadline; longer ones use a tokio interval. Either way
    /// cancellation is checked before each tick, so once this returns no
    /// further record writes happen.
    pub async fn run(
        self,
        period: Duration,
        tick_policy: TickPolicy,
        cancel: CancellationToken,
    ) -> CountersSnapshot {
        self.log_started(period, tick_policy);
        if period >= TIMER_RESOLUTION {
            return self.run_interval(period, tick_policy, cancel).await;
        }

        let counters = self.counters();
        match tokio::task::spawn_blocking(move || self.run_blocking(period, tick_policy, cancel))
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(error = %e, "Sampler thread failed");
                counters.snapshot()
            }
        }
    }

    async fn run_interval(
        mut self,
        period: Duration,
        tick_policy: TickPolicy,
        cancel: CancellationToken,
    ) -> CountersSnapshot {
        let mut ticker = tick_policy.interval(period);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
        self.stopped()
    }

    fn run_blocking(
        mut self,
        period: Duration,
        tick_policy: TickPolicy,
        cancel: CancellationToken,
    ) -> CountersSnapshot {
        let mut ticker = BlockingTicker::new(tick_policy, period);
        while !cancel.is_cancelled() {
            ticker.wait();
            if cancel.is_cancelled() {
                break;
            }
            self.tick();
        }
        self.stopped()
    }

    fn log_started(&self, period: Duration, tick_policy: TickPolicy) {
        info!(
            policy = self.policy.name(),
            period_us = period.as_micros() as u64,
            capacity = self.window.capacity(),
            dedicated_thread = period < TIMER_RESOLUTION,
            ?tick_policy,
            "Sampler started"
        );
    }

    fn stopped(&self) -> CountersSnapshot {
        let counters = self.counters.snapshot();
        info!(
            ticks = counters.ticks,
            read_failures = counters.read_failures,
            write_failures = counters.write_failures,
            "Sampler stopped"
        );
        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use titrate_common::BufferState;
    use titrate_test::memory_kernel;

    fn set_occupancy(probe: &titrate_test::KernelProbe, bits: u64) {
        probe.buffer_state.update(|state| state.current_buffer_bits = bits);
    }

    #[test]
    fn test_static_tick_writes_simple_average() {
        let (bridge, probe) = memory_kernel();
        let (maps, _) = bridge.split();
        let stats = Arc::new(SharedStats::new());
        let mut sampler = Sampler::new(
            maps,
            4,
            Policy::Static { threshold_mtu: 100 },
            Arc::clone(&stats),
        );

        for bits in [100, 200, 300] {
            set_occupancy(&probe, bits);
            sampler.tick();
        }

        assert_eq!(probe.avg_queue_state.get().avg_queue_bits, 200);
        assert_eq!(
            stats.snapshot(),
            Averages {
                simple: 200,
                filtered: None
            }
        );
    }

    #[test]
    fn test_adaptive_tick_writes_filtered_average() {
        let (bridge, probe) = memory_kernel();
        let (maps, _) = bridge.split();
        let stats = Arc::new(SharedStats::new());
        let mut sampler = Sampler::new(maps, 5, Policy::Adaptive, Arc::clone(&stats));

        for bits in [100, 100, 100, 100, 1_000] {
            set_occupancy(&probe, bits);
            sampler.tick();
        }

        assert_eq!(probe.avg_queue_state.get().avg_queue_bits, 100);
        assert_eq!(
            stats.snapshot(),
            Averages {
                simple: 280,
                filtered: Some(100)
            }
        );
    }

    #[test]
    fn test_read_failure_skips_tick() {
        let (bridge, probe) = memory_kernel();
        let (maps, _) = bridge.split();
        let mut sampler = Sampler::new(maps, 4, Policy::Adaptive, Arc::new(SharedStats::new()));

        set_occupancy(&probe, 500);
        sampler.tick();
        probe.buffer_state.fail_reads(true);
        assert_eq!(sampler.tick(), None);
        probe.buffer_state.fail_reads(false);

        assert_eq!(sampler.window().len(), 1);
        assert_eq!(probe.buffer_state.reads(), 1);
        assert_eq!(probe.avg_queue_state.writes(), 1);
        let counters = sampler.counters().snapshot();
        assert_eq!(counters.ticks, 2);
        assert_eq!(counters.read_failures, 1);
    }

    #[test]
    fn test_write_failure_still_publishes() {
        let (bridge, probe) = memory_kernel();
        let (maps, _) = bridge.split();
        let stats = Arc::new(SharedStats::new());
        let mut sampler = Sampler::new(
            maps,
            4,
            Policy::Static { threshold_mtu: 10 },
            Arc::clone(&stats),
        );

        probe.avg_queue_state.fail_writes(true);
        probe.buffer_state.set(BufferState {
            current_buffer_bits: 12_000,
            ..BufferState::default()
        });
        let averages = sampler.tick();

        assert_eq!(averages.map(|a| a.simple), Some(12_000));
        assert_eq!(stats.snapshot().simple, 12_000);
        assert_eq!(probe.avg_queue_state.get().avg_queue_bits, 0);
        assert_eq!(sampler.counters().snapshot().write_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let (bridge, probe) = memory_kernel();
        let (maps, _) = bridge.split();
        let sampler = Sampler::new(maps, 8, Policy::Adaptive, Arc::new(SharedStats::new()));
        set_occupancy(&probe, 3_000);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler.run(
            Duration::from_millis(1),
            TickPolicy::Burst,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let counters = handle.await.unwrap();

        assert!(counters.ticks >= 9, "ticks = {}", counters.ticks);
        let writes = probe.avg_queue_state.writes();
        assert_eq!(writes, counters.ticks);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probe.avg_queue_state.writes(), writes);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sub_millisecond_run_samples_each_period() {
        let (bridge, probe) = memory_kernel();
        let (maps, _) = bridge.split();
        let sampler = Sampler::new(maps, 100, Policy::Adaptive, Arc::new(SharedStats::new()));
        set_occupancy(&probe, 12_000);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler.run(
            Duration::from_micros(500),
            TickPolicy::Burst,
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let counters = handle.await.unwrap();

        // one tick per 500us deadline, allowing for scheduler jitter
        assert!(
            (120..=220).contains(&counters.ticks),
            "ticks = {}",
            counters.ticks
        );
        let writes = probe.avg_queue_state.writes();
        assert_eq!(writes, counters.ticks);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(probe.avg_queue_state.writes(), writes);
    }
}
