//! Mock Hardware Implementations
//!
//! Provides simulated jet instruments for testing without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep),
//! so tests running on a paused clock see exact latencies.
//!
//! # Available Mocks
//!
//! - `MockThermalCamera` - centi-Kelvin frames with a hot spot under the jet
//! - `MockSpectrometer` - emission lines on a flat dark baseline
//! - `MockOscilloscope` - sinusoidal traces on 1 to 4 (or more) channels
//! - `MockMicrocontroller` - checksummed telemetry lines, records every actuation
//!
//! Every mock can be switched offline with `set_available(false)`, after which
//! its sampling calls fail and the facade reports the device unavailable.

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};

use crate::error::{DriverError, DriverErrorKind};
use crate::hardware::capabilities::{
    Actuator, Oscilloscope, RawSpectrum, Spectrometer, TelemetrySource, ThermalSensor,
};
use crate::hardware::readings::{Frame, ScopeReading};
use crate::hardware::registry::DeviceRegistry;
use crate::hardware::telemetry::{encode_line, FIELD_COUNT};

/// Shared online/offline switch.
#[derive(Debug, Clone)]
struct Availability(Arc<AtomicBool>);

impl Availability {
    fn online() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    fn set(&self, available: bool) {
        self.0.store(available, Ordering::SeqCst);
    }

    fn check(&self, device: &str) -> Result<()> {
        if !self.0.load(Ordering::SeqCst) {
            bail!("{device} is offline");
        }
        Ok(())
    }
}

// =============================================================================
// MockThermalCamera
// =============================================================================

/// Simulated radiometric camera.
///
/// Frames are a uniform ambient background with a cone-shaped hot spot whose
/// peak is at `hot_spot` (row, col).
pub struct MockThermalCamera {
    rows: usize,
    cols: usize,
    hot_spot: (usize, usize),
    peak_celsius: f64,
    latency: Duration,
    available: Availability,
}

impl MockThermalCamera {
    /// Camera with the given frame size and readout latency.
    pub fn new(rows: usize, cols: usize, latency: Duration) -> Self {
        Self {
            rows,
            cols,
            hot_spot: (rows / 2, cols / 2),
            peak_celsius: 45.0,
            latency,
            available: Availability::online(),
        }
    }

    /// Set the hot-spot peak temperature.
    pub fn with_peak(mut self, celsius: f64) -> Self {
        self.peak_celsius = celsius;
        self
    }

    /// Take the camera offline or bring it back.
    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }
}

#[async_trait]
impl ThermalSensor for MockThermalCamera {
    async fn capture_frame(&self) -> Result<Frame> {
        sleep(self.latency).await;
        self.available.check("MockThermalCamera")?;

        let ambient = 22.0;
        let (hr, hc) = self.hot_spot;
        let mut pixels = Vec::with_capacity(self.rows * self.cols);
        for r in 0..self.rows {
            for c in 0..self.cols {
                let dist = ((r as f64 - hr as f64).powi(2) + (c as f64 - hc as f64).powi(2)).sqrt();
                let celsius = (self.peak_celsius - dist).max(ambient);
                pixels.push((celsius * 100.0 + 27315.0).round() as u16);
            }
        }
        Ok(Frame::from_u16(vec![self.rows, self.cols], pixels)?)
    }
}

// =============================================================================
// MockSpectrometer
// =============================================================================

/// Simulated emission spectrometer covering 200-1000 nm.
pub struct MockSpectrometer {
    pixels: usize,
    integration_time_us: u64,
    latency: Duration,
    available: Availability,
}

impl MockSpectrometer {
    /// Spectrometer with `pixels` sensor pixels.
    pub fn new(pixels: usize, integration_time_us: u64, latency: Duration) -> Self {
        Self {
            pixels,
            integration_time_us,
            latency,
            available: Availability::online(),
        }
    }

    /// Take the spectrometer offline or bring it back.
    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }
}

#[async_trait]
impl Spectrometer for MockSpectrometer {
    async fn acquire(&self) -> Result<RawSpectrum> {
        sleep(self.latency).await;
        self.available.check("MockSpectrometer")?;

        let step = 800.0 / self.pixels.max(1) as f64;
        let wavelengths: Vec<f64> = (0..self.pixels).map(|i| 200.0 + i as f64 * step).collect();
        let mut rng = rand::thread_rng();
        // He I 706 nm and O I 777 nm lines over a dark baseline
        let intensities = wavelengths
            .iter()
            .map(|wl| {
                let line = |centre: f64, height: f64| height * (-(wl - centre).powi(2) / 8.0).exp();
                100.0 + line(706.5, 1500.0) + line(777.4, 2500.0) + rng.gen_range(-2.0..2.0)
            })
            .collect();

        Ok(RawSpectrum {
            wavelengths,
            intensities,
        })
    }

    fn integration_time_us(&self) -> u64 {
        self.integration_time_us
    }
}

// =============================================================================
// MockOscilloscope
// =============================================================================

/// Simulated streaming oscilloscope.
pub struct MockOscilloscope {
    channels: usize,
    samples: usize,
    latency: Duration,
    available: Availability,
}

impl MockOscilloscope {
    /// Scope streaming `samples` points on `channels` channels.
    ///
    /// More than four channels is allowed so archive limits can be exercised.
    pub fn new(channels: usize, samples: usize, latency: Duration) -> Self {
        Self {
            channels,
            samples,
            latency,
            available: Availability::online(),
        }
    }

    /// Take the scope offline or bring it back.
    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }
}

#[async_trait]
impl Oscilloscope for MockOscilloscope {
    async fn capture(&self) -> Result<ScopeReading> {
        sleep(self.latency).await;
        self.available.check("MockOscilloscope")?;

        // 20 kHz drive sampled at 1 MS/s
        let timebase: Vec<f64> = (0..self.samples).map(|i| i as f64 * 1e-6).collect();
        let channels = (0..self.channels)
            .map(|ch| {
                let letter = char::from(b'A' + (ch % 26) as u8);
                let phase = ch as f64 * PI / 4.0;
                let trace = timebase
                    .iter()
                    .map(|t| (2.0 * PI * 20e3 * t + phase).sin())
                    .collect();
                (letter, trace)
            })
            .collect::<BTreeMap<_, _>>();

        Ok(ScopeReading { timebase, channels })
    }
}

// =============================================================================
// MockMicrocontroller
// =============================================================================

/// Simulated jet microcontroller.
///
/// Emits one checksummed telemetry line per read, echoing the last setpoints
/// it received. Every actuation is recorded for inspection.
pub struct MockMicrocontroller {
    latency: Duration,
    available: Availability,
    fail_actuation: AtomicBool,
    corrupt_first: AtomicU64,
    started: tokio::time::Instant,
    setpoints: Mutex<(f64, f64, f64)>,
    actuations: Mutex<Vec<(f64, f64, f64)>>,
}

impl MockMicrocontroller {
    /// Microcontroller answering each read after `latency`.
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            available: Availability::online(),
            fail_actuation: AtomicBool::new(false),
            corrupt_first: AtomicU64::new(0),
            started: tokio::time::Instant::now(),
            setpoints: Mutex::new((0.0, 0.0, 100.0)),
            actuations: Mutex::new(Vec::new()),
        }
    }

    /// Take the telemetry stream offline or bring it back.
    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    /// Corrupt the checksum of the next `n` lines.
    pub fn corrupt_next_lines(&self, n: u64) {
        self.corrupt_first.store(n, Ordering::SeqCst);
    }

    /// Make every subsequent actuation fail.
    pub fn fail_actuation(&self, fail: bool) {
        self.fail_actuation.store(fail, Ordering::SeqCst);
    }

    /// All `(power, flow, duty)` commands received so far.
    pub async fn actuations(&self) -> Vec<(f64, f64, f64)> {
        self.actuations.lock().await.clone()
    }
}

#[async_trait]
impl TelemetrySource for MockMicrocontroller {
    async fn read_line(&self) -> Result<String> {
        sleep(self.latency).await;
        self.available.check("MockMicrocontroller")?;

        let (power, flow, duty) = *self.setpoints.lock().await;
        let t_ms = self.started.elapsed().as_secs_f64() * 1e3;
        let mut fields = [0.0; FIELD_COUNT];
        fields[0] = t_ms.round();
        fields[1] = 8.0 + power; // Vp2p
        fields[2] = 20.0; // kHz
        fields[3] = flow;
        fields[4] = 4.0; // dsep
        fields[5] = duty;
        fields[6] = 100.0 * power * flow;
        fields[7] = 1.2;
        fields[8] = 300.0 + 5.0 * power;
        fields[9] = 2.0;
        fields[13] = power;
        fields[14] = 0.95 * power;

        let mut line = encode_line(&fields);
        let pending = self.corrupt_first.load(Ordering::SeqCst);
        if pending > 0 {
            self.corrupt_first.store(pending - 1, Ordering::SeqCst);
            line.push('9');
        }
        Ok(line)
    }
}

#[async_trait]
impl Actuator for MockMicrocontroller {
    async fn actuate(&self, power: f64, flow: f64, duty_cycle: f64) -> Result<(), DriverError> {
        if self.fail_actuation.load(Ordering::SeqCst) {
            return Err(DriverError::new(
                "mock_microcontroller",
                DriverErrorKind::Communication,
                "simulated write failure",
            ));
        }
        *self.setpoints.lock().await = (power, flow, duty_cycle);
        self.actuations.lock().await.push((power, flow, duty_cycle));
        Ok(())
    }
}

// =============================================================================
// Simulated rig
// =============================================================================

/// Handles to every mock in a simulated rig.
#[allow(missing_docs)]
pub struct MockRig {
    pub camera: Arc<MockThermalCamera>,
    pub spectrometer: Arc<MockSpectrometer>,
    pub oscilloscope: Arc<MockOscilloscope>,
    pub microcontroller: Arc<MockMicrocontroller>,
}

impl MockRig {
    /// A rig where every device answers after `latency`.
    pub fn new(latency: Duration) -> Self {
        Self {
            camera: Arc::new(MockThermalCamera::new(48, 64, latency)),
            spectrometer: Arc::new(MockSpectrometer::new(512, 100_000, latency)),
            oscilloscope: Arc::new(MockOscilloscope::new(2, 256, latency)),
            microcontroller: Arc::new(MockMicrocontroller::new(latency)),
        }
    }

    /// Registry with every device of the rig registered.
    pub fn registry(&self) -> DeviceRegistry {
        DeviceRegistry::new()
            .with_thermal(self.camera.clone())
            .with_spectrometer(self.spectrometer.clone())
            .with_oscilloscope(self.oscilloscope.clone())
            .with_telemetry(self.microcontroller.clone())
            .with_actuator(self.microcontroller.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::telemetry::{decode_line, is_line_valid};

    #[tokio::test(start_paused = true)]
    async fn camera_frame_peaks_at_hot_spot() {
        let camera = MockThermalCamera::new(10, 12, Duration::from_millis(100)).with_peak(80.0);
        let start = tokio::time::Instant::now();
        let frame = camera.capture_frame().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(110));
        assert_eq!(frame.shape, vec![10, 12]);

        let reading = crate::hardware::thermal::analyze(frame, false, false).unwrap();
        assert!((reading.max_temperature - 80.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn offline_devices_fail_sampling() {
        let spec = MockSpectrometer::new(64, 1000, Duration::ZERO);
        spec.set_available(false);
        assert!(spec.acquire().await.is_err());
        spec.set_available(true);
        assert_eq!(spec.acquire().await.unwrap().intensities.len(), 64);
    }

    #[tokio::test]
    async fn scope_labels_channels_by_letter() {
        let scope = MockOscilloscope::new(3, 16, Duration::ZERO);
        let reading = scope.capture().await.unwrap();
        assert_eq!(reading.channels.keys().copied().collect::<Vec<_>>(), vec!['A', 'B', 'C']);
        assert!(reading.channels.values().all(|v| v.len() == 16));
    }

    #[tokio::test]
    async fn microcontroller_echoes_setpoints_and_can_corrupt_lines() {
        let mcu = MockMicrocontroller::new(Duration::ZERO);
        mcu.actuate(3.0, 1.5, 90.0).await.unwrap();

        mcu.corrupt_next_lines(1);
        assert!(!is_line_valid(&mcu.read_line().await.unwrap()));

        let reading = decode_line(&mcu.read_line().await.unwrap()).unwrap();
        assert_eq!(reading.power_setpoint, 3.0);
        assert_eq!(reading.setpoints.flow, 1.5);
        assert_eq!(reading.duty_cycle, 90.0);
        assert_eq!(mcu.actuations().await, vec![(3.0, 1.5, 90.0)]);
    }
}
