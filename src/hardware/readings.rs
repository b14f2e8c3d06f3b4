//! Reading types produced by the device facade.
//!
//! Every sampling call yields one [`DeviceReading`]. A device that is disabled,
//! stalled past its retry budget or faulted reports [`DeviceReading::Unavailable`]
//! instead of a value, and the aggregator substitutes sentinels for it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// The sampled instrument kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Imaging thermal camera.
    Thermal,
    /// Optical emission spectrometer.
    Spectral,
    /// Streaming oscilloscope.
    Oscilloscope,
    /// Microcontroller telemetry link.
    Embedded,
}

impl DeviceKind {
    /// All kinds in registry order.
    pub const ALL: [DeviceKind; 4] = [
        DeviceKind::Thermal,
        DeviceKind::Spectral,
        DeviceKind::Oscilloscope,
        DeviceKind::Embedded,
    ];
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeviceKind::Thermal => "thermal",
            DeviceKind::Spectral => "spectral",
            DeviceKind::Oscilloscope => "oscilloscope",
            DeviceKind::Embedded => "embedded",
        };
        f.write_str(label)
    }
}

/// A handle the registry must hold before a run can start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequiredDevice {
    /// A sampled instrument.
    Instrument(DeviceKind),
    /// The power/flow actuator.
    Actuator,
}

impl From<DeviceKind> for RequiredDevice {
    fn from(kind: DeviceKind) -> Self {
        RequiredDevice::Instrument(kind)
    }
}

impl fmt::Display for RequiredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequiredDevice::Instrument(kind) => kind.fmt(f),
            RequiredDevice::Actuator => f.write_str("actuator"),
        }
    }
}

// =============================================================================
// Frames
// =============================================================================

/// Element type of a raw image frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    /// 8-bit pixels (visible cameras).
    U8,
    /// 16-bit pixels (centi-Kelvin radiometric frames).
    U16,
}

impl PixelType {
    /// Width of one pixel in bytes.
    pub fn size_bytes(self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
        }
    }
}

/// Pixel payload of a frame.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum FrameData {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

/// A 2D (or multi-plane 3D) image frame in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Dimensions, outermost first (e.g. `[rows, cols]` or `[planes, rows, cols]`).
    pub shape: Vec<usize>,
    /// Pixel values.
    pub data: FrameData,
}

impl Frame {
    /// Build a 16-bit frame, checking the pixel count against the shape.
    pub fn from_u16(shape: Vec<usize>, data: Vec<u16>) -> AppResult<Self> {
        check_len(&shape, data.len())?;
        Ok(Self {
            shape,
            data: FrameData::U16(data),
        })
    }

    /// Build an 8-bit frame, checking the pixel count against the shape.
    pub fn from_u8(shape: Vec<usize>, data: Vec<u8>) -> AppResult<Self> {
        check_len(&shape, data.len())?;
        Ok(Self {
            shape,
            data: FrameData::U8(data),
        })
    }

    /// An all-zero frame used in place of a missing capture.
    pub fn zeros(pixel_type: PixelType, shape: &[usize]) -> Self {
        let len = shape.iter().product();
        let data = match pixel_type {
            PixelType::U8 => FrameData::U8(vec![0; len]),
            PixelType::U16 => FrameData::U16(vec![0; len]),
        };
        Self {
            shape: shape.to_vec(),
            data,
        }
    }

    /// Element type of this frame.
    pub fn pixel_type(&self) -> PixelType {
        match self.data {
            FrameData::U8(_) => PixelType::U8,
            FrameData::U16(_) => PixelType::U16,
        }
    }

    /// Number of pixels.
    pub fn len(&self) -> usize {
        match &self.data {
            FrameData::U8(v) => v.len(),
            FrameData::U16(v) => v.len(),
        }
    }

    /// True when the frame holds no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the frame on disk.
    pub fn byte_len(&self) -> usize {
        self.len() * self.pixel_type().size_bytes()
    }

    /// Write the pixels little-endian into `out`, which must be exactly `byte_len()` long.
    pub fn write_le(&self, out: &mut [u8]) {
        match &self.data {
            FrameData::U8(v) => out.copy_from_slice(v),
            FrameData::U16(v) => {
                for (chunk, px) in out.chunks_exact_mut(2).zip(v) {
                    chunk.copy_from_slice(&px.to_le_bytes());
                }
            }
        }
    }

    /// Decode a frame from little-endian bytes.
    pub fn read_le(pixel_type: PixelType, shape: &[usize], bytes: &[u8]) -> AppResult<Self> {
        let len: usize = shape.iter().product();
        if bytes.len() != len * pixel_type.size_bytes() {
            return Err(DaqError::FrameLayout(format!(
                "expected {} bytes for shape {:?}, got {}",
                len * pixel_type.size_bytes(),
                shape,
                bytes.len()
            )));
        }
        let data = match pixel_type {
            PixelType::U8 => FrameData::U8(bytes.to_vec()),
            PixelType::U16 => FrameData::U16(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
        };
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }
}

fn check_len(shape: &[usize], len: usize) -> AppResult<()> {
    let expected: usize = shape.iter().product();
    if expected != len {
        return Err(DaqError::FrameLayout(format!(
            "shape {:?} needs {} pixels, got {}",
            shape, expected, len
        )));
    }
    Ok(())
}

// =============================================================================
// Per-device readings
// =============================================================================

/// Thermal camera sample.
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalReading {
    /// Hottest pixel, degrees Celsius.
    pub max_temperature: f64,
    /// Ring averages at 2 and 12 pixels from the hottest pixel.
    pub spatial_temperatures: Option<(f64, f64)>,
    /// Raw radiometric frame, kept when imaging is saved.
    pub raw_frame: Option<Frame>,
}

/// Spectrometer sample after baseline correction.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralReading {
    /// Sum of the corrected spectrum past the first 20 pixels.
    pub total_intensity: f64,
    /// Corrected spectrum.
    pub spectrum: Vec<f64>,
    /// Wavelength axis (empty unless entire spectra are collected).
    pub wavelengths: Vec<f64>,
    /// Baseline subtracted from the raw spectrum.
    pub baseline_shift: f64,
}

/// Oscilloscope capture.
#[derive(Debug, Clone, PartialEq)]
pub struct ScopeReading {
    /// Sample times shared by all channels.
    pub timebase: Vec<f64>,
    /// Samples per channel, keyed by channel letter (`'A'`..).
    pub channels: BTreeMap<char, Vec<f64>>,
}

/// Voltage, frequency and flow setpoints echoed by the microcontroller.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Setpoints {
    pub voltage: f64,
    pub frequency: f64,
    pub flow: f64,
}

/// Jet position; `z` is the tip-to-substrate separation.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// Decoded telemetry line.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EmbeddedReading {
    /// Microcontroller clock, ms.
    pub timestamp_ms: f64,
    /// Echoed input setpoints.
    pub setpoints: Setpoints,
    /// Stage position.
    pub position: Position,
    /// Duty cycle, %.
    pub duty_cycle: f64,
    /// Embedded photodiode intensity.
    pub intensity: f64,
    /// Embedded voltage, kV.
    pub voltage: f64,
    /// Embedded temperature, K.
    pub temperature: f64,
    /// Embedded current, mA.
    pub current: f64,
    /// Power setpoint, W.
    pub power_setpoint: f64,
    /// Measured power, W.
    pub power: f64,
}

impl EmbeddedReading {
    /// Number of columns in an embedded table row.
    pub const COLUMNS: usize = 14;

    /// Table row in the order of the persisted embedded header.
    pub fn to_row(&self) -> [f64; Self::COLUMNS] {
        [
            self.timestamp_ms,
            self.intensity,
            self.setpoints.voltage,
            self.setpoints.frequency,
            self.setpoints.flow,
            self.position.x,
            self.position.y,
            self.position.z,
            self.temperature,
            self.power,
            self.power_setpoint,
            self.duty_cycle,
            self.voltage,
            self.current,
        ]
    }
}

/// One device's contribution to a tick.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceReading {
    Thermal(ThermalReading),
    Spectral(SpectralReading),
    Oscilloscope(ScopeReading),
    Embedded(EmbeddedReading),
    Unavailable(DeviceKind),
}

impl DeviceReading {
    /// Kind of device this reading belongs to.
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceReading::Thermal(_) => DeviceKind::Thermal,
            DeviceReading::Spectral(_) => DeviceKind::Spectral,
            DeviceReading::Oscilloscope(_) => DeviceKind::Oscilloscope,
            DeviceReading::Embedded(_) => DeviceKind::Embedded,
            DeviceReading::Unavailable(kind) => *kind,
        }
    }

    /// False for [`DeviceReading::Unavailable`].
    pub fn is_available(&self) -> bool {
        !matches!(self, DeviceReading::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u16_frame_le_bytes_survive_a_copy_through_a_buffer() {
        let frame = Frame::from_u16(vec![2, 2], vec![1, 256, 65535, 0]).unwrap();
        let mut buf = vec![0u8; frame.byte_len()];
        frame.write_le(&mut buf);
        assert_eq!(buf, vec![1, 0, 0, 1, 255, 255, 0, 0]);

        let back = Frame::read_le(PixelType::U16, &[2, 2], &buf).unwrap();
        assert_eq!(back, frame);
    }

    #[test]
    fn frame_rejects_pixel_count_mismatch() {
        assert!(Frame::from_u8(vec![3, 3], vec![0; 8]).is_err());
        assert!(Frame::read_le(PixelType::U16, &[2, 2], &[0; 7]).is_err());
    }

    #[test]
    fn embedded_row_follows_table_column_order() {
        let reading = EmbeddedReading {
            timestamp_ms: 1.0,
            setpoints: Setpoints {
                voltage: 3.0,
                frequency: 4.0,
                flow: 5.0,
            },
            position: Position {
                x: 6.0,
                y: 7.0,
                z: 8.0,
            },
            duty_cycle: 12.0,
            intensity: 2.0,
            voltage: 13.0,
            temperature: 9.0,
            current: 14.0,
            power_setpoint: 11.0,
            power: 10.0,
        };
        let row = reading.to_row();
        let expected: Vec<f64> = (1..=14).map(f64::from).collect();
        assert_eq!(row.to_vec(), expected);
    }

    #[test]
    fn unavailable_keeps_its_kind() {
        let reading = DeviceReading::Unavailable(DeviceKind::Oscilloscope);
        assert_eq!(reading.kind(), DeviceKind::Oscilloscope);
        assert!(!reading.is_available());
    }
}
