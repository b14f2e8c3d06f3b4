//! Run Configuration using Figment
//!
//! Settings are layered, later sources overriding earlier ones:
//! 1. Compiled-in defaults (`RunSettings::default()`)
//! 2. A TOML file (`config/run.toml` unless another path is given)
//! 3. Environment variables prefixed with `PLASMA_DAQ_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use plasma_daq::config::{RunConfig, RunSettings};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // PLASMA_DAQ_COLLECT__OSCILLOSCOPE=false disables the scope for this run
//! let settings = RunSettings::load_from("config/run.toml")?;
//! let config = RunConfig::new(settings, vec![2.0; 60], vec![3.0; 60])?;
//! assert_eq!(config.niter(), 60);
//! # Ok(())
//! # }
//! ```
//!
//! [`RunSettings`] is what the operator writes down; [`RunConfig`] is the
//! validated, immutable value handed to every component of a run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{AppResult, DaqError};
use crate::hardware::telemetry::TelemetryPolicy;
use crate::hardware::DeviceKind;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "PLASMA_DAQ_";

/// Default settings file.
pub const DEFAULT_CONFIG_PATH: &str = "config/run.toml";

/// Which instruments are sampled each tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectFlags {
    /// Surface temperature from the thermal camera.
    pub thermal: bool,
    /// Ring temperatures around the hottest pixel.
    pub spatial_temp: bool,
    /// Total intensity from the spectrometer.
    pub spectral: bool,
    /// Keep the wavelength axis alongside each spectrum.
    pub entire_spectra: bool,
    /// Oscilloscope traces.
    pub oscilloscope: bool,
    /// Microcontroller telemetry.
    pub embedded: bool,
}

impl Default for CollectFlags {
    fn default() -> Self {
        Self {
            thermal: true,
            spatial_temp: true,
            spectral: true,
            entire_spectra: true,
            oscilloscope: true,
            embedded: true,
        }
    }
}

impl CollectFlags {
    /// Whether `kind` is sampled.
    pub fn enabled(&self, kind: DeviceKind) -> bool {
        match kind {
            DeviceKind::Thermal => self.thermal,
            DeviceKind::Spectral => self.spectral,
            DeviceKind::Oscilloscope => self.oscilloscope,
            DeviceKind::Embedded => self.embedded,
        }
    }
}

/// Which artifacts are written at the end of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveFlags {
    /// Input/output table and overrun list.
    pub data: bool,
    /// Spatial temperature table.
    pub spatial_temp: bool,
    /// Spectral archive.
    pub spectra: bool,
    /// Oscilloscope archive.
    pub oscilloscope: bool,
    /// Embedded telemetry table.
    pub embedded: bool,
    /// Raw thermal frames.
    pub images: bool,
}

impl Default for SaveFlags {
    fn default() -> Self {
        Self {
            data: true,
            spatial_temp: true,
            spectra: true,
            oscilloscope: true,
            embedded: true,
            images: true,
        }
    }
}

/// Microcontroller link settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Lines tried per sample before the link is reported unavailable.
    pub max_attempts: u32,
    /// Time budget per sample, ms.
    pub time_budget_ms: u64,
    /// Serial port path; `None` when running simulated.
    pub port: Option<String>,
    /// Serial baud rate.
    pub baud_rate: u32,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        let policy = TelemetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            time_budget_ms: policy.time_budget.as_millis() as u64,
            port: None,
            baud_rate: 38400,
        }
    }
}

impl TelemetrySettings {
    /// Retry bounds for one telemetry read.
    pub fn policy(&self) -> TelemetryPolicy {
        TelemetryPolicy {
            max_attempts: self.max_attempts,
            time_budget: Duration::from_millis(self.time_budget_ms),
        }
    }
}

/// Output location settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Root directory for run outputs.
    pub output_dir: PathBuf,
    /// Label used for the run directory and backup file.
    pub run_label: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            run_label: "OL_data".to_string(),
        }
    }
}

/// Log output format.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Compact,
    Json,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Operator-facing run settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Sampling period, seconds.
    pub sampling_period_s: f64,
    /// Frames per batch file.
    pub frame_batch_size: usize,
    /// Duty cycle sent with every actuation, %.
    pub duty_cycle: f64,
    /// Spectrometer integration time, µs.
    pub integration_time_us: u64,
    /// Instruments to sample.
    pub collect: CollectFlags,
    /// Artifacts to write.
    pub save: SaveFlags,
    /// Microcontroller link.
    pub telemetry: TelemetrySettings,
    /// Output location.
    pub storage: StorageSettings,
    /// Logging.
    pub logging: LoggingSettings,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            sampling_period_s: 1.0,
            frame_batch_size: 200,
            duty_cycle: 100.0,
            integration_time_us: 72_000,
            collect: CollectFlags::default(),
            save: SaveFlags::default(),
            telemetry: TelemetrySettings::default(),
            storage: StorageSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl RunSettings {
    /// Load from the default settings file and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific TOML file and the environment.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path).extract()?)
    }

    /// The provider stack used by [`RunSettings::load_from`].
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(RunSettings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Render the effective settings as TOML, in the settings file layout.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("Failed to render settings: {e}")))
    }

    /// Sampling period as a duration.
    pub fn sampling_period(&self) -> Duration {
        Duration::from_secs_f64(self.sampling_period_s)
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> AppResult<()> {
        if !self.sampling_period_s.is_finite() || self.sampling_period_s <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "sampling_period_s must be positive, got {}",
                self.sampling_period_s
            )));
        }

        if self.frame_batch_size == 0 {
            return Err(DaqError::Configuration(
                "frame_batch_size must be at least 1".to_string(),
            ));
        }

        if self.telemetry.max_attempts == 0 {
            return Err(DaqError::Configuration(
                "telemetry.max_attempts must be at least 1".to_string(),
            ));
        }

        if !(0.0..=100.0).contains(&self.duty_cycle) {
            return Err(DaqError::Configuration(format!(
                "duty_cycle must be within 0-100 %, got {}",
                self.duty_cycle
            )));
        }

        // the spectrometer needs roughly two integrations per period
        let integration_s = self.integration_time_us as f64 * 1e-6;
        if self.collect.spectral && self.sampling_period_s < 2.0 * integration_s {
            return Err(DaqError::Configuration(format!(
                "sampling period {} s is shorter than twice the integration time ({} s)",
                self.sampling_period_s, integration_s
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }
}

/// Validated, immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    settings: RunSettings,
    power: Vec<f64>,
    flow: Vec<f64>,
    metadata: BTreeMap<String, String>,
}

impl RunConfig {
    /// Validate `settings` and pair them with the input sequences.
    ///
    /// The iteration count is the length of the shorter sequence; the longer
    /// one is truncated with a warning.
    pub fn new(settings: RunSettings, mut power: Vec<f64>, mut flow: Vec<f64>) -> AppResult<Self> {
        settings.validate()?;

        let niter = power.len().min(flow.len());
        if power.len() != flow.len() {
            warn!(
                power_len = power.len(),
                flow_len = flow.len(),
                niter,
                "Input sequences differ in length, using the shorter one"
            );
        }
        if niter == 0 {
            return Err(DaqError::Configuration(
                "power and flow sequences must not be empty".to_string(),
            ));
        }
        power.truncate(niter);
        flow.truncate(niter);

        Ok(Self {
            settings,
            power,
            flow,
            metadata: BTreeMap::new(),
        })
    }

    /// Attach a free-form note that is stored with the run record.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Underlying settings.
    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Number of recorded ticks.
    pub fn niter(&self) -> usize {
        self.power.len()
    }

    /// Power setpoints, one per tick.
    pub fn power(&self) -> &[f64] {
        &self.power
    }

    /// Flow setpoints, one per tick.
    pub fn flow(&self) -> &[f64] {
        &self.flow
    }

    /// Run notes.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Sampling period as a duration.
    pub fn sampling_period(&self) -> Duration {
        self.settings.sampling_period()
    }

    /// Whether `kind` is sampled.
    pub fn collects(&self, kind: DeviceKind) -> bool {
        self.settings.collect.enabled(kind)
    }
}
