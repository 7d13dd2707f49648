//! Common infrastructure for the titrate AQM controller.
//!
//! The in-kernel XDP datapath makes every per-packet admit/drop decision.
//! This crate describes the contract the userspace controller holds with it:
//!
//! - [`records`]: the singleton records shared with the datapath
//! - [`bridge`]: typed, uncached read/write access to those records
//! - [`datapath`]: interface resolution, allow-listing and attachment seams
//! - [`error`]: error taxonomy for bootstrap and steady-state operations
//!
//! # Architecture
//!
//! ```text
//!   titrated (userspace)                         XDP datapath (kernel)
//!  +--------------------+   rate_limit_config   +--------------------+
//!  | Lifecycle          |---------------------->|                    |
//!  |  Sampler ----------|--- avg_queue_state -->|  admit / drop      |
//!  |  Reporter <--------|<-- buffer_state ------|  threshold update  |
//!  |                    |<-- throughput_stats --|                    |
//!  | Attachment Manager |--- allowed_interfaces>|                    |
//!  +--------------------+                       +--------------------+
//! ```

pub mod bridge;
pub mod datapath;
pub mod error;
pub mod records;

// Re-export commonly used items at crate root
pub use bridge::{KernelStateBridge, RecordMap, ReporterMaps, SamplerMaps};
pub use datapath::{DatapathAttach, InterfaceResolver, LinkHandle};
pub use error::{RecordKind, ShaperError, ShaperResult};
pub use records::{
    AdaptiveParams, AdaptiveThreshold, AvgQueueState, BufferState, ShapingConfig,
    ThroughputStats, BITS_PER_MTU, FIXED_POINT_FACTOR,
};
