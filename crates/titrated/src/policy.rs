//! Control policies.
//!
//! Static and adaptive shaping share the whole control loop and differ in
//! two places only: which average is fed back to the datapath and which
//! telemetry columns are emitted.

use titrate_common::{BufferState, ShapingConfig};

use crate::stats::Averages;
use crate::window::SampleWindow;

const STATIC_HEADER: &str =
    "ElapsedTimeNs,TotalZeroBufferNs,Throughput,LastUpdateNs,CurrentBufferBits,BufferPercentage";

const ADAPTIVE_HEADER: &str = "ElapsedTimeNs,TotalZeroBufferNs,Throughput,LastUpdateNs,\
CurrentThresholdMtu,SsthreshMtu,CurrentBufferBits,SimpleAvgBits,FilteredAvgBits,BufferPercentage";

/// Values for one telemetry row, already derived.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetryRow {
    pub elapsed_ns: u64,
    pub total_zero_buffer_ns: u64,
    pub throughput: f64,
    pub last_update_ns: u64,
    pub current_threshold_mtu: u64,
    pub ssthresh_mtu: u64,
    pub current_buffer_bits: u64,
    pub averages: Averages,
    pub buffer_percentage: f64,
}

/// Control policy applied by the sampler and the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Fixed threshold, simple moving average.
    Static { threshold_mtu: u64 },
    /// Datapath-managed threshold, outlier-filtered average.
    Adaptive,
}

impl Policy {
    /// Derives the policy from the shaping configuration.
    pub fn from_config(config: &ShapingConfig) -> Self {
        match config {
            ShapingConfig::Static { threshold_mtu, .. } => Policy::Static {
                threshold_mtu: *threshold_mtu,
            },
            ShapingConfig::Adaptive { .. } => Policy::Adaptive,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Policy::Static { .. } => "static",
            Policy::Adaptive => "titrate",
        }
    }

    /// Computes this tick's averages over the window.
    pub fn averages(&self, window: &SampleWindow) -> Averages {
        let simple = window.simple_average();
        match self {
            Policy::Static { .. } => Averages {
                simple,
                filtered: None,
            },
            Policy::Adaptive => Averages {
                simple,
                filtered: Some(window.filtered_average(simple)),
            },
        }
    }

    /// Threshold the buffer percentage is measured against, in MTU.
    ///
    /// Static uses the configured value; adaptive uses the datapath's
    /// current threshold.
    pub fn threshold_mtu(&self, state: &BufferState) -> u64 {
        match self {
            Policy::Static { threshold_mtu } => *threshold_mtu,
            Policy::Adaptive => state
                .adaptive
                .map(|a| a.current_threshold_mtu)
                .unwrap_or_default(),
        }
    }

    pub fn csv_header(&self) -> &'static str {
        match self {
            Policy::Static { .. } => STATIC_HEADER,
            Policy::Adaptive => ADAPTIVE_HEADER,
        }
    }

    /// Formats one CSV row (no trailing newline).
    pub fn format_row(&self, row: &TelemetryRow) -> String {
        match self {
            Policy::Static { .. } => format!(
                "{},{},{:.6},{},{},{:.6}",
                row.elapsed_ns,
                row.total_zero_buffer_ns,
                row.throughput,
                row.last_update_ns,
                row.current_buffer_bits,
                row.buffer_percentage,
            ),
            Policy::Adaptive => format!(
                "{},{},{:.6},{},{},{},{},{},{},{:.6}",
                row.elapsed_ns,
                row.total_zero_buffer_ns,
                row.throughput,
                row.last_update_ns,
                row.current_threshold_mtu,
                row.ssthresh_mtu,
                row.current_buffer_bits,
                row.averages.simple,
                row.averages.filtered.unwrap_or_default(),
                row.buffer_percentage,
            ),
        }
    }
}
