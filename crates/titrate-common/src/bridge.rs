//! Kernel State Bridge.
//!
//! Typed access to the four singleton records. Nothing is cached: the
//! datapath mutates buffer and throughput state on every packet, so every
//! read and write goes straight to the map transport. Atomicity of a single
//! record read or write is the transport's job; no userspace lock is taken.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{RecordKind, ShaperError, ShaperResult};
use crate::records::{AvgQueueState, BufferState, ShapingConfig, ThroughputStats};

/// Transport for one singleton record.
///
/// Implementations perform a fresh, synchronous map operation on every
/// call and report failures as [`ShaperError::StateRead`] /
/// [`ShaperError::StateWrite`].
pub trait RecordMap<R>: Send + Sync {
    /// Looks up the record.
    fn read(&self) -> ShaperResult<R>;

    /// Overwrites the record.
    fn write(&mut self, value: &R) -> ShaperResult<()>;
}

/// First write of a record. Failure here is a startup precondition.
fn initialize<R>(map: &mut dyn RecordMap<R>, record: RecordKind, value: &R) -> ShaperResult<()> {
    match map.write(value) {
        Ok(()) => {
            debug!(%record, "Initialized kernel record");
            Ok(())
        }
        Err(ShaperError::StateWrite { reason, .. }) => Err(ShaperError::state_init(record, reason)),
        Err(e) => Err(ShaperError::state_init(record, e)),
    }
}

/// All four kernel records, owned during bootstrap.
pub struct KernelStateBridge {
    shaping_config: Box<dyn RecordMap<ShapingConfig>>,
    buffer_state: Box<dyn RecordMap<BufferState>>,
    throughput_stats: Box<dyn RecordMap<ThroughputStats>>,
    avg_queue_state: Box<dyn RecordMap<AvgQueueState>>,
}

impl KernelStateBridge {
    /// Creates a bridge over the given record transports.
    pub fn new(
        shaping_config: Box<dyn RecordMap<ShapingConfig>>,
        buffer_state: Box<dyn RecordMap<BufferState>>,
        throughput_stats: Box<dyn RecordMap<ThroughputStats>>,
        avg_queue_state: Box<dyn RecordMap<AvgQueueState>>,
    ) -> Self {
        Self {
            shaping_config,
            buffer_state,
            throughput_stats,
            avg_queue_state,
        }
    }

    /// Seeds every record from configuration.
    ///
    /// Writes the shaping configuration, an empty buffer state carrying the
    /// initial threshold, zeroed throughput counters and a zero average, in
    /// that order. The first failure aborts with [`ShaperError::StateInit`].
    pub fn seed(&mut self, config: &ShapingConfig) -> ShaperResult<()> {
        initialize(
            self.shaping_config.as_mut(),
            RecordKind::ShapingConfig,
            config,
        )?;
        initialize(
            self.buffer_state.as_mut(),
            RecordKind::BufferState,
            &config.initial_buffer_state(),
        )?;
        initialize(
            self.throughput_stats.as_mut(),
            RecordKind::ThroughputStats,
            &ThroughputStats::default(),
        )?;
        initialize(
            self.avg_queue_state.as_mut(),
            RecordKind::AvgQueueState,
            &AvgQueueState::default(),
        )?;

        info!(
            rate_bps = config.rate_bps(),
            threshold_mtu = config.initial_threshold_mtu(),
            "Kernel records initialized"
        );
        Ok(())
    }

    /// Reads the shaping configuration back from the datapath.
    pub fn read_shaping_config(&self) -> ShaperResult<ShapingConfig> {
        self.shaping_config.read()
    }

    /// Hands out the per-loop views.
    ///
    /// The sampler becomes the only writer of the average record; both loops
    /// share read access to the buffer state.
    pub fn split(self) -> (SamplerMaps, ReporterMaps) {
        let buffer_state: Arc<dyn RecordMap<BufferState>> = Arc::from(self.buffer_state);
        (
            SamplerMaps {
                buffer_state: Arc::clone(&buffer_state),
                avg_queue_state: self.avg_queue_state,
            },
            ReporterMaps {
                buffer_state,
                throughput_stats: self.throughput_stats,
            },
        )
    }
}

/// Records the sampler touches.
pub struct SamplerMaps {
    buffer_state: Arc<dyn RecordMap<BufferState>>,
    avg_queue_state: Box<dyn RecordMap<AvgQueueState>>,
}

impl SamplerMaps {
    /// Current buffer state.
    pub fn read_buffer_state(&self) -> ShaperResult<BufferState> {
        self.buffer_state.read()
    }

    /// Publishes the smoothed queue estimate to the datapath.
    pub fn write_avg_queue(&mut self, avg_queue_bits: u64) -> ShaperResult<()> {
        self.avg_queue_state
            .write(&AvgQueueState { avg_queue_bits })
    }
}

/// Records the reporter touches.
pub struct ReporterMaps {
    buffer_state: Arc<dyn RecordMap<BufferState>>,
    throughput_stats: Box<dyn RecordMap<ThroughputStats>>,
}

impl ReporterMaps {
    /// Current buffer state.
    pub fn read_buffer_state(&self) -> ShaperResult<BufferState> {
        self.buffer_state.read()
    }

    /// Current throughput counters.
    pub fn read_throughput_stats(&self) -> ShaperResult<ThroughputStats> {
        self.throughput_stats.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Minimal record backed by a shared cell.
    struct CellRecord<R> {
        kind: RecordKind,
        value: Arc<Mutex<R>>,
        fail_writes: bool,
    }

    impl<R: Copy + Send> RecordMap<R> for CellRecord<R> {
        fn read(&self) -> ShaperResult<R> {
            Ok(*self.value.lock().unwrap())
        }

        fn write(&mut self, value: &R) -> ShaperResult<()> {
            if self.fail_writes {
                return Err(ShaperError::state_write(self.kind, "EPERM"));
            }
            *self.value.lock().unwrap() = *value;
            Ok(())
        }
    }

    fn cell<R: Copy + Default>(kind: RecordKind) -> (CellRecord<R>, Arc<Mutex<R>>) {
        let value = Arc::new(Mutex::new(R::default()));
        (
            CellRecord {
                kind,
                value: Arc::clone(&value),
                fail_writes: false,
            },
            value,
        )
    }

    fn static_config() -> ShapingConfig {
        ShapingConfig::Static {
            rate_bps: 100_000_000,
            threshold_mtu: 100,
        }
    }

    #[test]
    fn test_seed_and_split() {
        let config_cell = Arc::new(Mutex::new(static_config()));
        let config = CellRecord {
            kind: RecordKind::ShapingConfig,
            value: Arc::clone(&config_cell),
            fail_writes: false,
        };
        let (buffer, buffer_cell) = cell::<BufferState>(RecordKind::BufferState);
        let (stats, _) = cell::<ThroughputStats>(RecordKind::ThroughputStats);
        let (avg, avg_cell) = cell::<AvgQueueState>(RecordKind::AvgQueueState);

        let mut bridge =
            KernelStateBridge::new(Box::new(config), Box::new(buffer), Box::new(stats), Box::new(avg));
        bridge.seed(&static_config()).unwrap();
        assert_eq!(bridge.read_shaping_config().unwrap(), static_config());

        let (mut sampler, reporter) = bridge.split();
        buffer_cell.lock().unwrap().current_buffer_bits = 4200;
        assert_eq!(sampler.read_buffer_state().unwrap().current_buffer_bits, 4200);
        assert_eq!(reporter.read_buffer_state().unwrap().current_buffer_bits, 4200);

        sampler.write_avg_queue(77).unwrap();
        assert_eq!(avg_cell.lock().unwrap().avg_queue_bits, 77);
    }

    #[test]
    fn test_seed_failure_is_state_init() {
        let (buffer, _) = cell::<BufferState>(RecordKind::BufferState);
        let (stats, _) = cell::<ThroughputStats>(RecordKind::ThroughputStats);
        let (mut avg, _) = cell::<AvgQueueState>(RecordKind::AvgQueueState);
        avg.fail_writes = true;
        let shaping = CellRecord {
            kind: RecordKind::ShapingConfig,
            value: Arc::new(Mutex::new(static_config())),
            fail_writes: false,
        };

        let mut bridge =
            KernelStateBridge::new(Box::new(shaping), Box::new(buffer), Box::new(stats), Box::new(avg));
        let err = bridge.seed(&static_config()).unwrap_err();
        assert!(matches!(
            err,
            ShaperError::StateInit {
                record: RecordKind::AvgQueueState,
                ..
            }
        ));
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "Failed to initialize avg_queue_state: EPERM");
    }
}
