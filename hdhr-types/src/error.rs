//! Failure taxonomy for the tuner controller.

use thiserror::Error;

use crate::response::{STATUS_COMM_ERROR, STATUS_FAILURE};

/// Errors surfaced by the device driver facade.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Communication with the tuner failed (timeout, dead socket, gone
    /// device).
    #[error("communication error: {0}")]
    Comm(String),

    /// The tuner understood the request and refused it.
    #[error("rejected by tuner: {0}")]
    Rejected(String),

    /// The operation does not exist on this device type.
    #[error("unsupported on this device type")]
    Unsupported,
}

impl DriverError {
    /// Map onto the raw status-code convention of
    /// [`DeviceResponse`](crate::DeviceResponse).
    pub fn status_code(&self) -> i32 {
        match self {
            DriverError::Comm(_) => STATUS_COMM_ERROR,
            DriverError::Rejected(_) | DriverError::Unsupported => STATUS_FAILURE,
        }
    }
}

/// Errors returned synchronously from the controller's public surface.
///
/// Lock contention and ordinary driver failures are *not* represented
/// here: those are expected outcomes reported through a
/// [`DeviceResponse`](crate::DeviceResponse) on the event bus. Only
/// conditions detected before any device call is issued, plus device
/// binding failures, reach the caller as errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControllerError {
    /// No device is currently bound to the controller.
    #[error("no device set")]
    NoDevice,

    /// A directly-tuned channel number fell outside the active channel
    /// map's range. No device call was issued.
    #[error("channel {channel} out of range: valid range for this channel map is {min} to {max}")]
    ChannelOutOfRange { channel: u32, min: u32, max: u32 },

    /// The channel input could not be parsed as a number.
    #[error("failed to parse channel: {0:?}")]
    InvalidChannel(String),

    /// Device construction or binding failed. The controller rolled back
    /// any partially-constructed device before reporting this.
    #[error("device setup failed: {0}")]
    Setup(#[from] DriverError),

    /// The worker has already been stopped.
    #[error("device worker is no longer running")]
    WorkerGone,

    /// The worker execution context could not be started.
    #[error("failed to start device worker: {0}")]
    WorkerSpawn(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_error_status_codes() {
        assert_eq!(DriverError::Comm("x".into()).status_code(), STATUS_COMM_ERROR);
        assert_eq!(DriverError::Rejected("x".into()).status_code(), STATUS_FAILURE);
        assert_eq!(DriverError::Unsupported.status_code(), STATUS_FAILURE);
    }

    #[test]
    fn test_out_of_range_message() {
        let err = ControllerError::ChannelOutOfRange {
            channel: 99,
            min: 2,
            max: 69,
        };
        let msg = err.to_string();
        assert!(msg.contains("99"));
        assert!(msg.contains("2 to 69"));
    }
}
