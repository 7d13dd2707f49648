//! Telemetry Reporter.
//!
//! Low-frequency loop emitting one CSV row per tick from the buffer state,
//! the throughput counters and the latest published averages.

use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use titrate_common::{ReporterMaps, BITS_PER_MTU};

use crate::loops::{CountersSnapshot, LoopCounters, TickPolicy};
use crate::policy::{Policy, TelemetryRow};
use crate::stats::SharedStats;

/// Fraction of elapsed time the buffer was non-empty.
///
/// Zero when no time has elapsed.
pub fn throughput_ratio(total_zero_buffer_ns: u64, elapsed_ns: u64) -> f64 {
    if elapsed_ns == 0 {
        return 0.0;
    }
    1.0 - total_zero_buffer_ns as f64 / elapsed_ns as f64
}

/// Occupancy as a fraction of the threshold. Zero for a zero threshold.
pub fn buffer_percentage(current_buffer_bits: u64, threshold_mtu: u64) -> f64 {
    let threshold_bits = threshold_mtu.saturating_mul(BITS_PER_MTU);
    if threshold_bits == 0 {
        return 0.0;
    }
    current_buffer_bits as f64 / threshold_bits as f64
}

/// Emits telemetry rows to a sink.
pub struct Reporter<W> {
    maps: ReporterMaps,
    policy: Policy,
    stats: Arc<SharedStats>,
    sink: W,
    started: Instant,
    counters: Arc<LoopCounters>,
}

impl<W: Write + Send> Reporter<W> {
    /// `started` is the instant elapsed time is measured from.
    pub fn new(
        maps: ReporterMaps,
        policy: Policy,
        stats: Arc<SharedStats>,
        sink: W,
        started: Instant,
    ) -> Self {
        Self {
            maps,
            policy,
            stats,
            sink,
            started,
            counters: Arc::new(LoopCounters::new()),
        }
    }

    pub fn counters(&self) -> Arc<LoopCounters> {
        Arc::clone(&self.counters)
    }

    /// Writes the policy's CSV header line.
    pub fn write_header(&mut self) -> io::Result<()> {
        writeln!(self.sink, "{}", self.policy.csv_header())?;
        self.sink.flush()
    }

    /// Reads the kernel records and derives one row.
    ///
    /// Returns `None` when either record read fails.
    pub fn sample(&self) -> Option<TelemetryRow> {
        let buffer = match self.maps.read_buffer_state() {
            Ok(state) => state,
            Err(e) => {
                self.counters.record_read_failure();
                warn!(error = %e, "Reporter: skipping row");
                return None;
            }
        };
        let throughput = match self.maps.read_throughput_stats() {
            Ok(stats) => stats,
            Err(e) => {
                self.counters.record_read_failure();
                warn!(error = %e, "Reporter: skipping row");
                return None;
            }
        };

        let elapsed_ns = u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX);
        let threshold = buffer.adaptive.unwrap_or_default();
        Some(TelemetryRow {
            elapsed_ns,
            total_zero_buffer_ns: throughput.total_zero_buffer_ns,
            throughput: throughput_ratio(throughput.total_zero_buffer_ns, elapsed_ns),
            last_update_ns: buffer.last_update_ns,
            current_threshold_mtu: threshold.current_threshold_mtu,
            ssthresh_mtu: threshold.ssthresh_mtu,
            current_buffer_bits: buffer.current_buffer_bits,
            averages: self.stats.snapshot(),
            buffer_percentage: buffer_percentage(
                buffer.current_buffer_bits,
                self.policy.threshold_mtu(&buffer),
            ),
        })
    }

    /// Emits one row. Returns whether a row reached the sink.
    pub fn tick(&mut self) -> bool {
        self.counters.record_tick();
        let Some(row) = self.sample() else {
            return false;
        };

        let line = self.policy.format_row(&row);
        match writeln!(self.sink, "{line}").and_then(|()| self.sink.flush()) {
            Ok(()) => {
                self.counters.record_row();
                true
            }
            Err(e) => {
                self.counters.record_write_failure();
                warn!(error = %e, "Reporter: dropping row, sink write failed");
                false
            }
        }
    }

    /// Emits a row every `period` until `cancel` fires.
    pub async fn run(
        mut self,
        period: Duration,
        tick_policy: TickPolicy,
        cancel: CancellationToken,
    ) -> CountersSnapshot {
        let mut ticker = tick_policy.interval(period);
        info!(
            period_ms = period.as_millis() as u64,
            ?tick_policy,
            "Reporter started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }

        if let Err(e) = self.sink.flush() {
            debug!(error = %e, "Reporter: final flush failed");
        }
        let counters = self.counters.snapshot();
        info!(
            ticks = counters.ticks,
            rows = counters.rows_emitted,
            read_failures = counters.read_failures,
            write_failures = counters.write_failures,
            "Reporter stopped"
        );
        counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use titrate_common::{AdaptiveThreshold, BufferState, ThroughputStats};
    use titrate_test::{memory_kernel, SharedSink};

    use crate::stats::Averages;

    #[test]
    fn test_throughput_full_utilization() {
        assert_eq!(format!("{:.6}", throughput_ratio(0, 1_000_000)), "1.000000");
    }

    #[test]
    fn test_throughput_idle() {
        assert_eq!(
            format!("{:.6}", throughput_ratio(1_000_000, 1_000_000)),
            "0.000000"
        );
        assert_eq!(throughput_ratio(0, 0), 0.0);
    }

    #[test]
    fn test_buffer_percentage() {
        assert_eq!(buffer_percentage(6_000, 1), 0.5);
        assert_eq!(buffer_percentage(BITS_PER_MTU * 100, 100), 1.0);
        assert_eq!(buffer_percentage(42, 0), 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adaptive_row() {
        let (bridge, probe) = memory_kernel();
        let (_, maps) = bridge.split();
        let stats = Arc::new(SharedStats::new());
        stats.publish(Averages {
            simple: 280,
            filtered: Some(100),
        });
        probe.buffer_state.set(BufferState {
            current_buffer_bits: 300_000,
            last_update_ns: 77,
            adaptive: Some(AdaptiveThreshold {
                current_threshold_mtu: 50,
                ssthresh_mtu: 40,
            }),
        });
        probe.throughput_stats.set(ThroughputStats {
            program_start_ns: 1,
            total_zero_buffer_ns: 25_000_000,
        });

        let sink = SharedSink::new();
        let mut reporter =
            Reporter::new(maps, Policy::Adaptive, stats, sink.clone(), Instant::now());
        tokio::time::advance(Duration::from_millis(100)).await;

        reporter.write_header().unwrap();
        assert!(reporter.tick());
        assert_eq!(
            sink.lines(),
            vec![
                Policy::Adaptive.csv_header().to_string(),
                "100000000,25000000,0.750000,77,50,40,300000,280,100,0.500000".to_string(),
            ]
        );
        assert_eq!(sink.flushes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_skips_row() {
        let (bridge, probe) = memory_kernel();
        let (_, maps) = bridge.split();
        let sink = SharedSink::new();
        let mut reporter = Reporter::new(
            maps,
            Policy::Static { threshold_mtu: 10 },
            Arc::new(SharedStats::new()),
            sink.clone(),
            Instant::now(),
        );

        probe.throughput_stats.fail_reads(true);
        assert!(!reporter.tick());
        probe.throughput_stats.fail_reads(false);
        assert!(reporter.tick());

        assert_eq!(sink.lines().len(), 1);
        let counters = reporter.counters().snapshot();
        assert_eq!(counters.ticks, 2);
        assert_eq!(counters.read_failures, 1);
        assert_eq!(counters.rows_emitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_drops_row() {
        let (bridge, _probe) = memory_kernel();
        let (_, maps) = bridge.split();
        let sink = SharedSink::new();
        let mut reporter = Reporter::new(
            maps,
            Policy::Static { threshold_mtu: 10 },
            Arc::new(SharedStats::new()),
            sink.clone(),
            Instant::now(),
        );

        sink.fail_writes(true);
        assert!(!reporter.tick());
        sink.fail_writes(false);
        assert!(reporter.tick());

        assert_eq!(sink.lines().len(), 1);
        assert_eq!(reporter.counters().snapshot().write_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_emits_rows_until_cancel() {
        let (bridge, _probe) = memory_kernel();
        let (_, maps) = bridge.split();
        let sink = SharedSink::new();
        let reporter = Reporter::new(
            maps,
            Policy::Static { threshold_mtu: 10 },
            Arc::new(SharedStats::new()),
            sink.clone(),
            Instant::now(),
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reporter.run(
            Duration::from_millis(50),
            TickPolicy::Burst,
            cancel.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(175)).await;
        cancel.cancel();
        let counters = handle.await.unwrap();

        assert_eq!(counters.rows_emitted, 3);
        let elapsed: Vec<u64> = sink
            .lines()
            .iter()
            .map(|line| line.split(',').next().unwrap().parse().unwrap())
            .collect();
        assert_eq!(elapsed, vec![50_000_000, 100_000_000, 150_000_000]);
    }
}
