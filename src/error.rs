//! Error types for hybridgemm

use thiserror::Error;

/// Result type alias using hybridgemm's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring devices or dispatching a GEMM
#[derive(Error, Debug)]
pub enum Error {
    /// The runtime reports no usable accelerator
    #[error("No accelerator devices are visible to this process")]
    NoDevices,

    /// More devices were requested than the runtime exposes
    #[error("Requested {requested} devices but only {available} are visible")]
    TooManyDevices {
        /// Number of devices requested
        requested: usize,
        /// Number of devices visible
        available: usize,
    },

    /// A device index outside the visible range
    #[error("Device index {index} is out of range ({available} devices visible)")]
    InvalidDevice {
        /// The offending index
        index: usize,
        /// Number of devices visible
        available: usize,
    },

    /// A device runtime call failed
    #[error("Device {device}: {operation} failed: {reason}")]
    DeviceOperation {
        /// Device index the call was issued against
        device: usize,
        /// The runtime operation (e.g. "stream create", "H2D A")
        operation: &'static str,
        /// Backend-reported reason
        reason: String,
    },

    /// Device memory allocation failed
    #[error("Device {device}: out of memory allocating {size} bytes")]
    OutOfMemory {
        /// Device index
        device: usize,
        /// Requested size in bytes
        size: usize,
    },

    /// A slot's operands do not fit in its scratch region
    #[error("Slot {slot}: operands need {needed} bytes, scratch holds {available}")]
    ScratchOverflow {
        /// Slot index
        slot: usize,
        /// Bytes required
        needed: usize,
        /// Bytes available
        available: usize,
    },

    /// Invalid argument provided to an operation
    #[error("Invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// Split ratio outside (0, 1]
    #[error("Split ratio {value} is outside (0, 1]")]
    InvalidSplit {
        /// The rejected value
        value: f32,
    },

    /// Operation requires an initialized device registry
    #[error("Device registry is not initialized")]
    NotInitialized,

    /// Malformed configuration override
    #[error("Invalid configuration value for {key}: {reason}")]
    Config {
        /// The variable or field name
        key: String,
        /// Reason for rejection
        reason: String,
    },

    /// I/O error from a profiling sink
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a device operation error
    pub fn device(device: usize, operation: &'static str, reason: impl Into<String>) -> Self {
        Self::DeviceOperation {
            device,
            operation,
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error leaves the accelerator environment unusable.
    ///
    /// Initialization failures (missing devices, context/stream creation,
    /// scratch allocation) are fatal: the caller should not continue in a
    /// degraded mode. Per-slot failures inside a hybrid run and argument
    /// errors are not.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::NoDevices
            | Self::TooManyDevices { .. }
            | Self::InvalidDevice { .. }
            | Self::OutOfMemory { .. } => true,
            Self::DeviceOperation { operation, .. } => matches!(
                *operation,
                "bind device" | "stream create" | "allocate" | "memory info" | "device count"
            ),
            _ => false,
        }
    }
}
