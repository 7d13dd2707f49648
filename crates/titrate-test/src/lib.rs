//! Test infrastructure for titrated
//!
//! Provides:
//! - In-memory kernel records with fault injection
//! - A fake XDP attach backend and a fixed interface resolver
//! - A shared in-memory telemetry sink
//! - Shaping configuration fixtures
//! - CSV telemetry parsing and verification helpers

pub mod fixtures;
mod memory;
mod verification;

pub use fixtures::*;
pub use memory::*;
pub use verification::*;
