//! Custom error types for the application.
//!
//! This module defines the primary error type, `RadmonError`, for the entire
//! application. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures a device session
//! can produce, so that callers branch on tagged variants instead of matching
//! on exception strings.
//!
//! ## Error kinds
//!
//! - **`Decode`**: a raw HID frame failed terminator or checksum validation.
//!   The frame is dropped and the next read is independent, so callers log
//!   and continue.
//! - **`ConnectionLost`**: an I/O failure that indicates the device is gone
//!   (unplugged, port closed). Terminal for the current session; the driver
//!   halts and must be reopened.
//! - **`Timeout`**: a serial read yielded nothing within the read timeout.
//!   A soft failure; the command produced no usable value and may be retried.
//! - **`Rejected`**: the device answered, but not with an `OK` status. The
//!   link is fine; the command result is unusable.
//! - **`MalformedRecord`**: a datalog or history record failed to parse. The
//!   record is skipped and the batch continues.
//!
//! Only `ConnectionLost` and open-time failures (`Io` from a missing device
//! file, a failed feature-report ioctl) terminate a driver; everything else
//! degrades a single reading.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, RadmonError>;

#[derive(Error, Debug)]
pub enum RadmonError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV output error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Frame decode error: {0}")]
    Decode(String),

    #[error("Connection to device lost: {0}")]
    ConnectionLost(String),

    #[error("No response from device")]
    Timeout,

    #[error("Device rejected command: '{0}'")]
    Rejected(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Serial support not enabled. Rebuild with --features device_radpro")]
    SerialFeatureDisabled,

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl RadmonError {
    /// Whether the error ends the device session. Recoverable errors degrade
    /// a single reading or cycle without stopping the driver.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RadmonError::ConnectionLost(_)
                | RadmonError::Io(_)
                | RadmonError::SerialFeatureDisabled
                | RadmonError::Unsupported(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_loss_is_fatal() {
        assert!(RadmonError::ConnectionLost("unplugged".into()).is_fatal());
    }

    #[test]
    fn soft_failures_are_recoverable() {
        assert!(!RadmonError::Timeout.is_fatal());
        assert!(!RadmonError::Rejected("ERROR".into()).is_fatal());
        assert!(!RadmonError::Decode("checksum".into()).is_fatal());
        assert!(!RadmonError::MalformedRecord("abc,def".into()).is_fatal());
    }
}
