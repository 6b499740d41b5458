// Amazon ENA/EFA Command Queue Core
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Error types for admin queue, AENQ and I/O queue operations.

use thiserror::Error;

/// Errors that can occur while driving the device rings.
#[derive(Debug, Error)]
pub enum ComError {
    /// No register response or admin completion within the deadline.
    #[error("operation timed out")]
    Timeout,

    /// The device status register does not report ready.
    #[error("device is not ready")]
    DeviceNotReady,

    /// All admin command slots are outstanding (host-side backpressure).
    #[error("admin queue full")]
    QueueFull,

    /// The admin queue has latched a fatal condition; a device reset is required.
    #[error("admin queue is not running")]
    NotRunning,

    /// Feature or opcode not supported by the device.
    #[error("operation not supported by the device")]
    Unsupported,

    /// Malformed request, detected host-side or reported by the device.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Device-side allocation failure.
    #[error("device resources exhausted")]
    ResourceExhausted,

    /// Device-side transient busy.
    #[error("device busy")]
    Busy,

    /// Command was in flight when the queue was torn down.
    #[error("command aborted")]
    Aborted,

    /// A completion or event did not match host bookkeeping.
    #[error("protocol desync: {0}")]
    ProtocolDesync(String),

    /// Host DMA allocation failed.
    #[error("DMA allocation of {size} bytes failed")]
    OutOfMemory { size: usize },

    /// Device or controller version below the supported minimum.
    #[error("unsupported {what} version {found:#010x} (minimum {required:#010x})")]
    UnsupportedVersion {
        what: &'static str,
        found: u32,
        required: u32,
    },

    /// Lifecycle transition refused in the current state.
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },
}

impl ComError {
    /// Returns true if the error is host-side backpressure worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QueueFull | Self::Busy)
    }
}

/// Result type alias for core operations.
pub type ComResult<T> = Result<T, ComError>;

/// Status byte written by the device into an admin completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminStatus {
    Success,
    ResourceAllocationFailure,
    BadOpcode,
    UnsupportedOpcode,
    MalformedRequest,
    IllegalParameter,
    UnknownError,
    ResourceBusy,
    /// Status code outside the documented table.
    Unknown(u8),
}

impl From<u8> for AdminStatus {
    fn from(status: u8) -> Self {
        match status {
            0 => Self::Success,
            1 => Self::ResourceAllocationFailure,
            2 => Self::BadOpcode,
            3 => Self::UnsupportedOpcode,
            4 => Self::MalformedRequest,
            5 => Self::IllegalParameter,
            6 => Self::UnknownError,
            7 => Self::ResourceBusy,
            _ => Self::Unknown(status),
        }
    }
}

impl AdminStatus {
    /// Raw status byte.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::ResourceAllocationFailure => 1,
            Self::BadOpcode => 2,
            Self::UnsupportedOpcode => 3,
            Self::MalformedRequest => 4,
            Self::IllegalParameter => 5,
            Self::UnknownError => 6,
            Self::ResourceBusy => 7,
            Self::Unknown(status) => status,
        }
    }

    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Translate the device status into the error taxonomy.
    ///
    /// Unknown codes map to `InvalidParameter` rather than panicking.
    pub fn into_result(self) -> ComResult<()> {
        match self {
            Self::Success => Ok(()),
            Self::ResourceAllocationFailure => Err(ComError::ResourceExhausted),
            Self::UnsupportedOpcode => Err(ComError::Unsupported),
            Self::ResourceBusy => Err(ComError::Busy),
            Self::BadOpcode
            | Self::MalformedRequest
            | Self::IllegalParameter
            | Self::UnknownError
            | Self::Unknown(_) => Err(ComError::InvalidParameter(format!(
                "device rejected command with status {:#04x}",
                self.as_u8()
            ))),
        }
    }
}
