//! Instrument Capabilities
//!
//! Fine-grained capability traits implemented by the jet instruments. Each trait
//! exposes the raw acquisition a driver can perform; analysis (temperature
//! conversion, baseline correction, telemetry decoding) happens above the trait
//! so every driver returns the same raw shapes.
//!
//! - A thermal camera implements: `ThermalSensor`
//! - A spectrometer implements: `Spectrometer`
//! - A streaming oscilloscope implements: `Oscilloscope`
//! - The microcontroller link implements: `TelemetrySource + Actuator`
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for sampling errors
//! - Focuses on ONE thing
//!
//! Sampling errors are absorbed by the facade and turned into unavailable
//! readings. Actuation errors are typed [`DriverError`]s because a failed
//! actuation stops the run.

use anyhow::Result;
use async_trait::async_trait;

use crate::error::DriverError;
use crate::hardware::readings::{Frame, ScopeReading};

/// Capability: Radiometric Imaging
///
/// Cameras that deliver frames of centi-Kelvin `u16` pixels.
///
/// # Contract
/// - Returns the next frame from the camera's queue, waiting if none is ready
/// - Frame shape is fixed for the lifetime of the device
#[async_trait]
pub trait ThermalSensor: Send + Sync {
    /// Pop the next radiometric frame.
    async fn capture_frame(&self) -> Result<Frame>;
}

/// Raw spectrometer acquisition before baseline correction.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSpectrum {
    /// Wavelength axis, nm.
    pub wavelengths: Vec<f64>,
    /// Counts per pixel.
    pub intensities: Vec<f64>,
}

/// Capability: Emission Spectroscopy
///
/// # Contract
/// - One call performs one integration at the device's configured integration time
/// - `wavelengths` and `intensities` have equal length
#[async_trait]
pub trait Spectrometer: Send + Sync {
    /// Acquire one spectrum.
    async fn acquire(&self) -> Result<RawSpectrum>;

    /// Integration time in microseconds.
    fn integration_time_us(&self) -> u64;
}

/// Capability: Streaming Capture
#[async_trait]
pub trait Oscilloscope: Send + Sync {
    /// Stream one block and return the timebase with per-channel samples.
    async fn capture(&self) -> Result<ScopeReading>;
}

/// Capability: Line-Oriented Telemetry
///
/// Devices that emit one ASCII record per line (e.g. a microcontroller on a
/// serial port). Validation and decoding are done by the caller.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Read one raw line, without its terminator.
    async fn read_line(&self) -> Result<String>;
}

/// Capability: Jet Actuation
///
/// # Contract
/// - `actuate` sends power (W), flow (slm) and duty cycle (%) setpoints
/// - Returns once the command has been written to the device
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Issue one setpoint command.
    async fn actuate(&self, power: f64, flow: f64, duty_cycle: f64) -> Result<(), DriverError>;
}
