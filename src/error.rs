//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the acquisition loop.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the failures that can stop a run, from configuration issues to driver faults.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML parse failures or
//!   environment overrides that do not match the settings schema.
//! - **`Configuration`**: Semantic errors in a parsed configuration (e.g. a sampling
//!   period shorter than twice the spectrometer integration time). Caught during
//!   validation, before any device is touched.
//! - **`MissingDevice`**: A capability enabled in the run configuration, or the
//!   actuator, has no registered handle. Fatal at startup.
//! - **`Driver`**: An unrecoverable driver fault, see [`DriverError`]. Actuation
//!   failures inside the loop surface as this variant.
//! - **`TelemetryExhausted`**: The embedded link did not deliver a valid line within
//!   its retry budget. The facade converts this into an unavailable reading.
//! - **`ChannelCount`**, **`FrameLayout`**, **`Archive`**, **`Storage`**: Persistence
//!   failures. These are isolated per artifact by the persister.
//!
//! Device-level failures are absorbed at the facade boundary and never reach this
//! type; only startup errors and driver faults terminate a run.

use std::time::Duration;

use thiserror::Error;

use crate::hardware::RequiredDevice;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Required {0} device is not registered")]
    MissingDevice(RequiredDevice),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Telemetry link gave no valid line after {attempts} attempts ({elapsed:?})")]
    TelemetryExhausted { attempts: u32, elapsed: Duration },

    #[error("Oscilloscope archive supports 1 to 4 channels, got {0}")]
    ChannelCount(usize),

    #[error("Frame layout error: {0}")]
    FrameLayout(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

// =============================================================================
// Driver Errors
// =============================================================================

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    Initialization,
    Communication,
    Hardware,
    Timeout,
    InvalidParameter,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
        };
        write!(f, "{}", label)
    }
}

/// Fault reported by a device driver.
#[derive(Error, Debug, Clone)]
#[error("Driver '{driver}' {kind} error: {message}")]
pub struct DriverError {
    /// Driver that raised the fault (e.g. "serial_telemetry").
    pub driver: String,
    /// Fault category.
    pub kind: DriverErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl DriverError {
    /// Build a driver error.
    pub fn new(
        driver: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            driver: driver.into(),
            kind,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::DeviceKind;

    #[test]
    fn driver_error_display_includes_kind_and_driver() {
        let err = DriverError::new("serial_telemetry", DriverErrorKind::Communication, "port closed");
        assert_eq!(
            err.to_string(),
            "Driver 'serial_telemetry' communication error: port closed"
        );

        let wrapped: DaqError = err.into();
        assert!(matches!(wrapped, DaqError::Driver(_)));
    }

    #[test]
    fn missing_device_names_the_kind() {
        let err = DaqError::MissingDevice(DeviceKind::Spectral.into());
        assert_eq!(err.to_string(), "Required spectral device is not registered");

        let err = DaqError::MissingDevice(RequiredDevice::Actuator);
        assert_eq!(err.to_string(), "Required actuator device is not registered");
    }
}
