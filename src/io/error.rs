// src/io/error.rs
//
// Error taxonomy for transport adapters and handles.
//
// Framing problems are NOT represented here: those travel as FrameError
// annotations on protocol frames and never abort ingestion.

use thiserror::Error;

/// Typed transport/configuration error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum IoError {
    /// Failed to reach or acquire the device
    #[error("[{device}] connection failed: {reason}")]
    Connection { device: String, reason: String },

    /// Wire-level read failure
    #[error("[{device}] read failed: {reason}")]
    Read { device: String, reason: String },

    /// Wire-level write failure
    #[error("[{device}] write failed: {reason}")]
    Write { device: String, reason: String },

    /// Malformed data for the device protocol
    #[error("[{device}] protocol error: {reason}")]
    Protocol { device: String, reason: String },

    /// Operation did not complete in time
    #[error("[{device}] timed out during {operation}")]
    Timeout { device: String, operation: String },

    /// The device was enumerated without an OS path to open
    #[error("device-path-missing: {device}")]
    DevicePathMissing { device: String },

    /// An option value the transport cannot express
    #[error("unsupported-option: {option}")]
    UnsupportedOption { option: String },

    /// Handle used after close
    #[error("[{device}] handle is closed")]
    Closed { device: String },

    /// Configuration rejected before any wire I/O
    #[error("configuration error: {reason}")]
    Config { reason: String },
}

impl IoError {
    pub fn connection(device: &str, reason: impl Into<String>) -> Self {
        IoError::Connection {
            device: device.to_string(),
            reason: reason.into(),
        }
    }

    pub fn read(device: &str, reason: impl Into<String>) -> Self {
        IoError::Read {
            device: device.to_string(),
            reason: reason.into(),
        }
    }

    pub fn write(device: &str, reason: impl Into<String>) -> Self {
        IoError::Write {
            device: device.to_string(),
            reason: reason.into(),
        }
    }

    pub fn protocol(device: &str, reason: impl Into<String>) -> Self {
        IoError::Protocol {
            device: device.to_string(),
            reason: reason.into(),
        }
    }

    pub fn timeout(device: &str, operation: impl Into<String>) -> Self {
        IoError::Timeout {
            device: device.to_string(),
            operation: operation.into(),
        }
    }

    pub fn device_path_missing(device: &str) -> Self {
        IoError::DevicePathMissing {
            device: device.to_string(),
        }
    }

    pub fn unsupported_option(option: impl Into<String>) -> Self {
        IoError::UnsupportedOption {
            option: option.into(),
        }
    }

    pub fn closed(device: &str) -> Self {
        IoError::Closed {
            device: device.to_string(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        IoError::Config {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_device() {
        let err = IoError::connection("uart(/dev/ttyUSB0)", "no such device");
        assert!(err.to_string().contains("/dev/ttyUSB0"));
        assert!(err.to_string().contains("no such device"));
    }

    #[test]
    fn test_unsupported_option_code() {
        let err = IoError::unsupported_option("stopBits=1.5");
        assert!(err.to_string().starts_with("unsupported-option"));
    }
}
