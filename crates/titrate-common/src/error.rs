//! Error types for controller operations.
//!
//! Errors fall in two classes. Fatal-bootstrap errors abort startup with a
//! non-zero exit. Everything else is recoverable: it is logged and the
//! affected tick or interface is skipped.

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for controller operations.
pub type ShaperResult<T> = Result<T, ShaperError>;

/// Identifies one of the singleton kernel records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Rate limit and policy parameters.
    ShapingConfig,
    /// Buffer occupancy (and adaptive threshold state).
    BufferState,
    /// Cumulative throughput counters.
    ThroughputStats,
    /// Smoothed queue estimate written back by the sampler.
    AvgQueueState,
}

impl RecordKind {
    /// Returns the datapath map name backing this record.
    pub fn map_name(&self) -> &'static str {
        match self {
            RecordKind::ShapingConfig => "rate_limit_config",
            RecordKind::BufferState => "buffer_state",
            RecordKind::ThroughputStats => "throughput_stats",
            RecordKind::AvgQueueState => "avg_queue_state",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.map_name())
    }
}

/// Errors that can occur while controlling the datapath.
#[derive(Debug, Error)]
pub enum ShaperError {
    /// No usable interface name was configured.
    #[error("No network interface specified")]
    EmptyInterfaceList,

    /// Interface name could not be resolved to a kernel index.
    #[error("Failed to look up interface '{interface}': {reason}")]
    InterfaceNotFound {
        /// The interface name.
        interface: String,
        /// Resolver error.
        reason: String,
    },

    /// Writing the interface into the allow-list record failed.
    #[error("Failed to add interface index {if_index} to allow-list: {reason}")]
    AllowListWrite {
        /// Kernel interface index.
        if_index: u32,
        /// Map error.
        reason: String,
    },

    /// Attaching the XDP program to an interface failed.
    #[error("Failed to attach XDP program to '{interface}': {reason}")]
    Attach {
        /// The interface name.
        interface: String,
        /// Attach error.
        reason: String,
    },

    /// Releasing an attachment failed.
    #[error("Failed to detach XDP program from '{interface}': {reason}")]
    Detach {
        /// The interface name.
        interface: String,
        /// Detach error.
        reason: String,
    },

    /// Every configured interface failed to attach.
    #[error("Failed to attach XDP program to any of {requested} interface(s)")]
    NoInterfacesAttached {
        /// Number of non-empty names that were tried.
        requested: usize,
    },

    /// Seeding a kernel record at startup failed.
    #[error("Failed to initialize {record}: {reason}")]
    StateInit {
        /// The record being seeded.
        record: RecordKind,
        /// Map error.
        reason: String,
    },

    /// Looking up a kernel record failed.
    #[error("Error reading {record}: {reason}")]
    StateRead {
        /// The record being read.
        record: RecordKind,
        /// Map error.
        reason: String,
    },

    /// Updating a kernel record failed.
    #[error("Error updating {record}: {reason}")]
    StateWrite {
        /// The record being written.
        record: RecordKind,
        /// Map error.
        reason: String,
    },

    /// Loading the datapath object or one of its maps/programs failed.
    #[error("Loading datapath objects failed: {reason}")]
    Load {
        /// Loader error.
        reason: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The offending field or flag.
        field: String,
        /// Error message.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ShaperError {
    /// Creates an interface resolution error.
    pub fn interface_not_found(interface: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::InterfaceNotFound {
            interface: interface.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates an allow-list write error.
    pub fn allow_list_write(if_index: u32, reason: impl fmt::Display) -> Self {
        Self::AllowListWrite {
            if_index,
            reason: reason.to_string(),
        }
    }

    /// Creates an attach error.
    pub fn attach(interface: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Attach {
            interface: interface.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a detach error.
    pub fn detach(interface: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Detach {
            interface: interface.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a record seeding error.
    pub fn state_init(record: RecordKind, reason: impl fmt::Display) -> Self {
        Self::StateInit {
            record,
            reason: reason.to_string(),
        }
    }

    /// Creates a record read error.
    pub fn state_read(record: RecordKind, reason: impl fmt::Display) -> Self {
        Self::StateRead {
            record,
            reason: reason.to_string(),
        }
    }

    /// Creates a record write error.
    pub fn state_write(record: RecordKind, reason: impl fmt::Display) -> Self {
        Self::StateWrite {
            record,
            reason: reason.to_string(),
        }
    }

    /// Creates a loader error.
    pub fn load(reason: impl fmt::Display) -> Self {
        Self::Load {
            reason: reason.to_string(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error must abort startup.
    ///
    /// Per-interface and per-tick failures are recoverable: the interface
    /// or tick is skipped and the controller keeps going.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShaperError::EmptyInterfaceList
                | ShaperError::NoInterfacesAttached { .. }
                | ShaperError::StateInit { .. }
                | ShaperError::Load { .. }
                | ShaperError::InvalidConfig { .. }
                | ShaperError::Io(_)
        )
    }
}
