//! Singleton records shared with the XDP datapath.
//!
//! Every record lives at key 0 of a one-entry array map. These are the
//! controller-side views; the byte layouts the datapath expects are owned by
//! the loader backend.

/// Link-layer MTU used as the threshold unit, in bits (1500 bytes).
pub const BITS_PER_MTU: u64 = 1500 * 8;

/// Scale applied to the ssthresh multiplier before it is handed to the datapath.
pub const FIXED_POINT_FACTOR: f64 = 1_000_000.0;

/// Adaptive ("titrate") policy parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveParams {
    pub window_duration_ms: u64,
    pub decrease_constant: u64,
    pub min_threshold_mtu: u64,
    pub max_threshold_mtu: u64,
    pub initial_threshold_mtu: u64,
    pub windows_considered: u64,
    /// Multiplier scaled by [`FIXED_POINT_FACTOR`].
    pub ssthresh_multiplier: u64,
    pub ssthresh_enabled: bool,
}

impl AdaptiveParams {
    /// Converts a floating point multiplier to the datapath's fixed-point form.
    pub fn fixed_point_multiplier(multiplier: f64) -> u64 {
        (multiplier * FIXED_POINT_FACTOR) as u64
    }
}

/// Rate limit configuration written once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapingConfig {
    /// Fixed buffer threshold.
    Static { rate_bps: u64, threshold_mtu: u64 },
    /// Threshold that moves between configured bounds.
    Adaptive { rate_bps: u64, params: AdaptiveParams },
}

impl ShapingConfig {
    /// Shaping rate in bits per second.
    pub fn rate_bps(&self) -> u64 {
        match self {
            ShapingConfig::Static { rate_bps, .. } | ShapingConfig::Adaptive { rate_bps, .. } => {
                *rate_bps
            }
        }
    }

    /// Threshold the buffer state starts from, in MTU.
    pub fn initial_threshold_mtu(&self) -> u64 {
        match self {
            ShapingConfig::Static { threshold_mtu, .. } => *threshold_mtu,
            ShapingConfig::Adaptive { params, .. } => params.initial_threshold_mtu,
        }
    }

    /// Buffer state to seed the datapath with.
    ///
    /// The adaptive policy starts both its current threshold and its
    /// slow-start threshold at the configured initial threshold.
    pub fn initial_buffer_state(&self) -> BufferState {
        match self {
            ShapingConfig::Static { .. } => BufferState::default(),
            ShapingConfig::Adaptive { params, .. } => BufferState {
                adaptive: Some(AdaptiveThreshold {
                    current_threshold_mtu: params.initial_threshold_mtu,
                    ssthresh_mtu: params.initial_threshold_mtu,
                }),
                ..BufferState::default()
            },
        }
    }
}

/// Threshold state the adaptive datapath maintains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdaptiveThreshold {
    pub current_threshold_mtu: u64,
    pub ssthresh_mtu: u64,
}

/// Buffer occupancy as maintained by the datapath.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferState {
    /// Occupancy in bits.
    pub current_buffer_bits: u64,
    /// Monotonic kernel timestamp of the last update.
    pub last_update_ns: u64,
    /// Present only for the adaptive datapath.
    pub adaptive: Option<AdaptiveThreshold>,
}

/// Cumulative throughput counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThroughputStats {
    pub program_start_ns: u64,
    /// Nanoseconds the buffer was observed empty.
    pub total_zero_buffer_ns: u64,
}

/// Smoothed occupancy estimate fed back into the datapath.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AvgQueueState {
    pub avg_queue_bits: u64,
}
