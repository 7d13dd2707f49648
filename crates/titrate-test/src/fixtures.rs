//! Shaping configuration fixtures
//!
//! Values match the daemon's command-line defaults.

use titrate_common::{AdaptiveParams, ShapingConfig};

/// Default rate, 100 Mbit/s.
pub const DEFAULT_RATE_BPS: u64 = 100_000_000;

/// Static policy with a 100 MTU threshold.
pub fn static_shaping() -> ShapingConfig {
    ShapingConfig::Static {
        rate_bps: DEFAULT_RATE_BPS,
        threshold_mtu: 100,
    }
}

/// Default adaptive parameters.
pub fn adaptive_params() -> AdaptiveParams {
    AdaptiveParams {
        window_duration_ms: 200,
        decrease_constant: 1,
        min_threshold_mtu: 2,
        max_threshold_mtu: 100,
        initial_threshold_mtu: 50,
        windows_considered: 1,
        ssthresh_multiplier: AdaptiveParams::fixed_point_multiplier(1.5),
        ssthresh_enabled: false,
    }
}

/// Adaptive policy with [`adaptive_params`].
pub fn adaptive_shaping() -> ShapingConfig {
    ShapingConfig::Adaptive {
        rate_bps: DEFAULT_RATE_BPS,
        params: adaptive_params(),
    }
}

/// Interface names from a list of string slices.
pub fn interface_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}
