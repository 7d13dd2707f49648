//! titrated: userspace control plane for the titrate XDP AQM shaper.
//!
//! The datapath makes every per-packet decision in the kernel. This crate
//! runs the closed loop around it:
//!
//! - [`sampler`]: high-frequency occupancy sampling, windowed averaging and
//!   feedback into the datapath
//! - [`reporter`]: low-frequency CSV telemetry
//! - [`attach`]: interface resolution, allow-listing and attachment
//! - [`controller`]: startup and shutdown ordering
//! - [`config`]: command line and TOML configuration
//!
//! The static and adaptive ("titrate") shapers share all of the above and
//! differ only through [`policy::Policy`].

pub mod attach;
pub mod config;
pub mod controller;
#[cfg(target_os = "linux")]
pub mod ebpf;
pub mod loops;
pub mod policy;
pub mod reporter;
pub mod sampler;
pub mod stats;
pub mod window;

pub use attach::{parse_interface_list, AttachmentManager, InterfaceAttachment, ReleaseSummary};
pub use config::{Args, DaemonConfig, FileConfig, PolicyKind};
pub use controller::{Controller, ControllerSettings, ShutdownReport};
pub use loops::{BlockingTicker, CountersSnapshot, LoopCounters, TickPolicy, TIMER_RESOLUTION};
pub use policy::{Policy, TelemetryRow};
pub use reporter::{buffer_percentage, throughput_ratio, Reporter};
pub use sampler::Sampler;
pub use stats::{Averages, SharedStats};
pub use window::SampleWindow;
