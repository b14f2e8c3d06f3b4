//! Typed Device Registry
//!
//! One optional handle per instrument kind plus the actuator. Presence is
//! checked once, at startup, against the run configuration: a kind that is
//! collected but has no handle is fatal, as is a missing actuator. After that
//! check every lookup is total and the loop never consults string keys.
//!
//! The registry is also the sampling facade: [`DeviceRegistry::sample`] turns
//! any driver failure into [`DeviceReading::Unavailable`] so the aggregator
//! always receives exactly one reading per kind.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let registry = DeviceRegistry::new()
//!     .with_thermal(camera)
//!     .with_spectrometer(spectrometer)
//!     .with_telemetry(link.clone())
//!     .with_actuator(link);
//!
//! registry.validate(&config)?;
//! let reading = registry.sample(DeviceKind::Thermal, &config).await;
//! ```

use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{Actuator, Oscilloscope, Spectrometer, TelemetrySource, ThermalSensor};
use crate::hardware::readings::{DeviceKind, DeviceReading, RequiredDevice};
use crate::hardware::{spectral, telemetry, thermal};

/// Handles for every instrument of the rig.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    thermal: Option<Arc<dyn ThermalSensor>>,
    spectrometer: Option<Arc<dyn Spectrometer>>,
    oscilloscope: Option<Arc<dyn Oscilloscope>>,
    telemetry: Option<Arc<dyn TelemetrySource>>,
    actuator: Option<Arc<dyn Actuator>>,
}

impl DeviceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the thermal camera.
    pub fn with_thermal(mut self, device: Arc<dyn ThermalSensor>) -> Self {
        self.thermal = Some(device);
        self
    }

    /// Register the spectrometer.
    pub fn with_spectrometer(mut self, device: Arc<dyn Spectrometer>) -> Self {
        self.spectrometer = Some(device);
        self
    }

    /// Register the oscilloscope.
    pub fn with_oscilloscope(mut self, device: Arc<dyn Oscilloscope>) -> Self {
        self.oscilloscope = Some(device);
        self
    }

    /// Register the telemetry link.
    pub fn with_telemetry(mut self, device: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(device);
        self
    }

    /// Register the actuator.
    pub fn with_actuator(mut self, device: Arc<dyn Actuator>) -> Self {
        self.actuator = Some(device);
        self
    }

    /// Whether a handle is registered for `kind`.
    pub fn has(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Thermal => self.thermal.is_some(),
            DeviceKind::Spectral => self.spectrometer.is_some(),
            DeviceKind::Oscilloscope => self.oscilloscope.is_some(),
            DeviceKind::Embedded => self.telemetry.is_some(),
        }
    }

    /// Check every collected kind and the actuator are present.
    pub fn validate(&self, config: &RunConfig) -> AppResult<()> {
        for kind in DeviceKind::ALL {
            if config.collects(kind) && !self.has(kind) {
                return Err(DaqError::MissingDevice(kind.into()));
            }
        }
        if self.actuator.is_none() {
            return Err(DaqError::MissingDevice(RequiredDevice::Actuator));
        }

        if let Some(spec) = &self.spectrometer {
            let configured = config.settings().integration_time_us;
            if config.collects(DeviceKind::Spectral) && spec.integration_time_us() != configured {
                warn!(
                    device_us = spec.integration_time_us(),
                    configured_us = configured,
                    "Spectrometer integration time differs from configuration"
                );
            }
        }
        Ok(())
    }

    /// Sample one instrument.
    ///
    /// Disabled kinds return `Unavailable` without touching hardware, as do
    /// kinds whose driver fails.
    pub async fn sample(&self, kind: DeviceKind, config: &RunConfig) -> DeviceReading {
        if !config.collects(kind) {
            return DeviceReading::Unavailable(kind);
        }

        let result = match kind {
            DeviceKind::Thermal => self.sample_thermal(config).await,
            DeviceKind::Spectral => self.sample_spectral(config).await,
            DeviceKind::Oscilloscope => self.sample_oscilloscope().await,
            DeviceKind::Embedded => self.sample_embedded(config).await,
        };

        match result {
            Ok(reading) => reading,
            Err(e) => {
                warn!(device = %kind, error = %e, "Device unavailable, substituting sentinel");
                DeviceReading::Unavailable(kind)
            }
        }
    }

    /// Send setpoints to the actuator.
    pub async fn actuate(&self, power: f64, flow: f64, duty_cycle: f64) -> AppResult<()> {
        let actuator = self
            .actuator
            .as_ref()
            .ok_or(DaqError::MissingDevice(RequiredDevice::Actuator))?;
        actuator.actuate(power, flow, duty_cycle).await?;
        debug!(power, flow, duty_cycle, "Actuated");
        Ok(())
    }

    async fn sample_thermal(&self, config: &RunConfig) -> anyhow::Result<DeviceReading> {
        let device = self.thermal.as_ref().ok_or(DaqError::MissingDevice(DeviceKind::Thermal.into()))?;
        let frame = device.capture_frame().await?;
        let settings = config.settings();
        let reading = thermal::analyze(
            frame,
            settings.collect.spatial_temp,
            settings.save.images,
        )?;
        Ok(DeviceReading::Thermal(reading))
    }

    async fn sample_spectral(&self, config: &RunConfig) -> anyhow::Result<DeviceReading> {
        let device = self
            .spectrometer
            .as_ref()
            .ok_or(DaqError::MissingDevice(DeviceKind::Spectral.into()))?;
        let raw = device.acquire().await?;
        let keep_wavelengths = config.settings().collect.entire_spectra;
        Ok(DeviceReading::Spectral(spectral::correct(raw, keep_wavelengths)))
    }

    async fn sample_oscilloscope(&self) -> anyhow::Result<DeviceReading> {
        let device = self
            .oscilloscope
            .as_ref()
            .ok_or(DaqError::MissingDevice(DeviceKind::Oscilloscope.into()))?;
        Ok(DeviceReading::Oscilloscope(device.capture().await?))
    }

    async fn sample_embedded(&self, config: &RunConfig) -> anyhow::Result<DeviceReading> {
        let device = self
            .telemetry
            .as_ref()
            .ok_or(DaqError::MissingDevice(DeviceKind::Embedded.into()))?;
        let policy = config.settings().telemetry.policy();
        let reading = telemetry::read_embedded(device.as_ref(), &policy).await?;
        Ok(DeviceReading::Embedded(reading))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunSettings;
    use crate::hardware::mock::{MockMicrocontroller, MockRig, MockSpectrometer};
    use std::time::Duration;

    fn config(settings: RunSettings) -> RunConfig {
        RunConfig::new(settings, vec![1.0; 3], vec![2.0; 3]).unwrap()
    }

    #[test]
    fn missing_collected_device_is_fatal() {
        let mcu = Arc::new(MockMicrocontroller::new(Duration::ZERO));
        let registry = DeviceRegistry::new()
            .with_telemetry(mcu.clone())
            .with_actuator(mcu);

        let err = registry.validate(&config(RunSettings::default())).unwrap_err();
        assert!(matches!(
            err,
            DaqError::MissingDevice(RequiredDevice::Instrument(DeviceKind::Thermal))
        ));
    }

    #[test]
    fn disabled_kinds_need_no_handle() {
        let mcu = Arc::new(MockMicrocontroller::new(Duration::ZERO));
        let registry = DeviceRegistry::new()
            .with_telemetry(mcu.clone())
            .with_actuator(mcu);

        let mut settings = RunSettings::default();
        settings.collect.thermal = false;
        settings.collect.spectral = false;
        settings.collect.oscilloscope = false;
        registry.validate(&config(settings)).unwrap();
    }

    #[test]
    fn actuator_is_always_required() {
        let rig = MockRig::new(Duration::ZERO);
        let registry = DeviceRegistry::new()
            .with_thermal(rig.camera.clone())
            .with_spectrometer(rig.spectrometer.clone())
            .with_oscilloscope(rig.oscilloscope.clone())
            .with_telemetry(rig.microcontroller.clone());
        let err = registry.validate(&config(RunSettings::default())).unwrap_err();
        assert!(matches!(err, DaqError::MissingDevice(RequiredDevice::Actuator)));
    }

    #[tokio::test]
    async fn disabled_kind_is_unavailable_without_sampling() {
        let spectrometer = Arc::new(MockSpectrometer::new(64, 1000, Duration::from_secs(3600)));
        let registry = DeviceRegistry::new().with_spectrometer(spectrometer);

        let mut settings = RunSettings::default();
        settings.collect.spectral = false;
        // would hang for an hour if the device were touched
        let reading = registry.sample(DeviceKind::Spectral, &config(settings)).await;
        assert_eq!(reading, DeviceReading::Unavailable(DeviceKind::Spectral));
    }

    #[tokio::test]
    async fn failing_driver_becomes_unavailable() {
        let rig = MockRig::new(Duration::ZERO);
        rig.camera.set_available(false);
        let registry = rig.registry();

        let reading = registry
            .sample(DeviceKind::Thermal, &config(RunSettings::default()))
            .await;
        assert_eq!(reading, DeviceReading::Unavailable(DeviceKind::Thermal));

        let reading = registry
            .sample(DeviceKind::Embedded, &config(RunSettings::default()))
            .await;
        assert!(matches!(reading, DeviceReading::Embedded(_)));
    }

    #[tokio::test]
    async fn actuation_fault_is_a_driver_error() {
        let rig = MockRig::new(Duration::ZERO);
        rig.microcontroller.fail_actuation(true);
        let err = rig.registry().actuate(1.0, 1.0, 100.0).await.unwrap_err();
        assert!(matches!(err, DaqError::Driver(_)));
    }
}
