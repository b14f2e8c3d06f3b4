//! Result aggregation.
//!
//! The [`Aggregator`] owns the [`RunRecord`] for the duration of a run and
//! folds every tick into dense per-kind arrays. Arrays are allocated up front
//! with `Niter` rows holding sentinel values, so a tick whose device was
//! unavailable simply leaves its sentinel in place.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{RunConfig, SaveFlags};
use crate::data::frame_store::FrameBatches;
use crate::experiment::sampler::SampleSet;
use crate::hardware::{DeviceKind, EmbeddedReading};

/// Placeholder for a missing temperature, °C.
pub const TEMPERATURE_SENTINEL: f64 = -300.0;

/// Placeholder for missing intensity, spectrum or wavelength values.
pub const SPECTRAL_SENTINEL: f64 = -1.0;

/// Placeholder for missing oscilloscope and telemetry values.
pub const READING_SENTINEL: f64 = -1.0;

/// Ring temperatures per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpatialSeries {
    /// Ring average 2 pixels from the hottest pixel.
    pub ts2: Vec<f64>,
    /// Ring average 12 pixels from the hottest pixel.
    pub ts3: Vec<f64>,
}

/// Spectra per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectraSeries {
    /// Wavelength axis, taken from the first reading that carried one.
    pub wavelengths: Vec<f64>,
    /// `Niter` rows of corrected spectra.
    pub intensities: Vec<Vec<f64>>,
    /// Baseline shift per tick.
    pub mean_shifts: Vec<f64>,
}

/// Oscilloscope captures per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSeries {
    /// Sample times shared by every channel.
    pub timebase: Vec<f64>,
    /// `Niter` rows of samples per channel letter.
    pub channels: BTreeMap<String, Vec<Vec<f64>>>,
}

/// Everything recorded during one run.
///
/// This is also the shape of the backup snapshot, so it must stay
/// serializable without the raw frame bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Run directory label.
    pub run_label: String,
    /// When the first tick started.
    pub started_at: DateTime<Utc>,
    /// Sampling period, seconds.
    pub sampling_period_s: f64,
    /// Recorded ticks.
    pub niter: usize,
    /// Surface temperature per tick, °C.
    pub temperature: Vec<f64>,
    /// Total optical intensity per tick.
    pub intensity: Vec<f64>,
    /// Issued power per tick, W.
    pub power: Vec<f64>,
    /// Issued flow per tick, slm.
    pub flow: Vec<f64>,
    /// Indices of overrun ticks.
    pub overruns: Vec<usize>,
    /// Ring temperatures, when collected.
    pub spatial: Option<SpatialSeries>,
    /// Spectra, when collected.
    pub spectra: Option<SpectraSeries>,
    /// Oscilloscope traces, when collected.
    pub oscilloscope: Option<ScopeSeries>,
    /// Embedded telemetry rows, when collected.
    pub embedded: Option<Vec<[f64; EmbeddedReading::COLUMNS]>>,
    /// Frame batch descriptor, when images were stored.
    pub frames: Option<FrameBatches>,
    /// Save flags after auto-disabling absent sources.
    pub save: SaveFlags,
    /// Free-form run notes.
    pub metadata: BTreeMap<String, String>,
}

impl RunRecord {
    /// Drop the large matrices once they have been persisted.
    pub fn release_bulk(&mut self) {
        if let Some(spectra) = self.spectra.as_mut() {
            spectra.intensities = Vec::new();
        }
        if let Some(scope) = self.oscilloscope.as_mut() {
            scope.channels.clear();
        }
        self.embedded = None;
    }
}

/// Per-kind count of ticks that delivered a reading.
#[derive(Debug, Default)]
struct Seen {
    spatial: usize,
    spectral: usize,
    oscilloscope: usize,
    embedded: usize,
}

/// Folds ticks into a [`RunRecord`].
#[derive(Debug)]
pub struct Aggregator {
    record: RunRecord,
    collected: Vec<DeviceKind>,
    seen: Seen,
}

impl Aggregator {
    /// Size the record from the probe tick and the run configuration.
    ///
    /// Save flags whose source is absent from the probe are switched off and
    /// the corresponding section is not allocated.
    pub fn new(config: &RunConfig, probe: &SampleSet) -> Self {
        let settings = config.settings();
        let niter = config.niter();
        let mut save = settings.save;

        let thermal = probe.thermal();
        if save.images && thermal.and_then(|t| t.raw_frame.as_ref()).is_none() {
            warn!("No thermal frame in the probe, images will not be saved");
            save.images = false;
        }

        let spatial = match thermal.and_then(|t| t.spatial_temperatures) {
            Some(_) if settings.collect.spatial_temp => Some(SpatialSeries {
                ts2: vec![TEMPERATURE_SENTINEL; niter],
                ts3: vec![TEMPERATURE_SENTINEL; niter],
            }),
            _ => {
                if save.spatial_temp {
                    warn!("No spatial temperatures in the probe, spatial table will not be saved");
                }
                save.spatial_temp = false;
                None
            }
        };

        let spectra = match probe.spectral() {
            Some(reading) => Some(SpectraSeries {
                wavelengths: vec![SPECTRAL_SENTINEL; reading.spectrum.len()],
                intensities: vec![vec![SPECTRAL_SENTINEL; reading.spectrum.len()]; niter],
                mean_shifts: vec![SPECTRAL_SENTINEL; niter],
            }),
            None => {
                if save.spectra {
                    warn!("Spectrometer absent in the probe, spectra will not be saved");
                }
                save.spectra = false;
                None
            }
        };

        let oscilloscope = match probe.oscilloscope() {
            Some(reading) => {
                let samples = reading.timebase.len();
                Some(ScopeSeries {
                    timebase: reading.timebase.clone(),
                    channels: reading
                        .channels
                        .keys()
                        .map(|c| (c.to_string(), vec![vec![READING_SENTINEL; samples]; niter]))
                        .collect(),
                })
            }
            None => {
                if save.oscilloscope {
                    warn!("Oscilloscope absent in the probe, traces will not be saved");
                }
                save.oscilloscope = false;
                None
            }
        };

        let embedded = match probe.embedded() {
            Some(_) => Some(vec![[READING_SENTINEL; EmbeddedReading::COLUMNS]; niter]),
            None => {
                if save.embedded {
                    warn!("Embedded telemetry absent in the probe, it will not be saved");
                }
                save.embedded = false;
                None
            }
        };

        let record = RunRecord {
            run_label: settings.storage.run_label.clone(),
            started_at: Utc::now(),
            sampling_period_s: settings.sampling_period_s,
            niter,
            temperature: vec![TEMPERATURE_SENTINEL; niter],
            intensity: vec![SPECTRAL_SENTINEL; niter],
            power: vec![0.0; niter],
            flow: vec![0.0; niter],
            overruns: Vec::new(),
            spatial,
            spectra,
            oscilloscope,
            embedded,
            frames: None,
            save,
            metadata: config.metadata().clone(),
        };

        Self {
            record,
            collected: DeviceKind::ALL
                .into_iter()
                .filter(|k| config.collects(*k))
                .collect(),
            seen: Seen::default(),
        }
    }

    /// Save flags in effect after the probe.
    pub fn save_flags(&self) -> SaveFlags {
        self.record.save
    }

    /// Mark the start of the first recorded tick.
    pub fn mark_started(&mut self) {
        self.record.started_at = Utc::now();
    }

    /// Fold tick `index`, with the actuation that was issued for it.
    pub fn fold(&mut self, index: usize, set: &SampleSet, power: f64, flow: f64) {
        if index >= self.record.niter {
            warn!(tick = index, niter = self.record.niter, "Tick outside the run, ignored");
            return;
        }
        let record = &mut self.record;
        record.power[index] = power;
        record.flow[index] = flow;

        for kind in set.unavailable() {
            if self.collected.contains(&kind) {
                warn!(tick = index, device = %kind, "Device unavailable, substituting sentinel");
            }
        }

        if let Some(thermal) = set.thermal() {
            record.temperature[index] = thermal.max_temperature;
            if let (Some(series), Some((ts2, ts3))) =
                (record.spatial.as_mut(), thermal.spatial_temperatures)
            {
                series.ts2[index] = ts2;
                series.ts3[index] = ts3;
                self.seen.spatial += 1;
            }
        }

        if let Some(spectral) = set.spectral() {
            record.intensity[index] = spectral.total_intensity;
            if let Some(series) = record.spectra.as_mut() {
                for (dst, src) in series.intensities[index].iter_mut().zip(&spectral.spectrum) {
                    *dst = *src;
                }
                series.mean_shifts[index] = spectral.baseline_shift;
                let axis_missing = series.wavelengths.first() == Some(&SPECTRAL_SENTINEL);
                if axis_missing && !spectral.wavelengths.is_empty() {
                    for (dst, src) in series.wavelengths.iter_mut().zip(&spectral.wavelengths) {
                        *dst = *src;
                    }
                }
                self.seen.spectral += 1;
            }
        }

        if let (Some(scope), Some(series)) = (set.oscilloscope(), record.oscilloscope.as_mut()) {
            for (channel, samples) in &scope.channels {
                if let Some(rows) = series.channels.get_mut(&channel.to_string()) {
                    for (dst, src) in rows[index].iter_mut().zip(samples) {
                        *dst = *src;
                    }
                }
            }
            self.seen.oscilloscope += 1;
        }

        if let (Some(reading), Some(rows)) = (set.embedded(), record.embedded.as_mut()) {
            rows[index] = reading.to_row();
            self.seen.embedded += 1;
        }
    }

    /// Close the record with the overrun list and frame descriptor.
    ///
    /// Sections that never received a reading during the run are not saved.
    pub fn finish(mut self, overruns: Vec<usize>, frames: Option<FrameBatches>) -> RunRecord {
        let record = &mut self.record;
        record.overruns = overruns;
        if frames.as_ref().map_or(true, |f| f.frame_count == 0) {
            record.save.images = false;
        }
        record.frames = frames;

        let absent = [
            (self.seen.spatial, &mut record.save.spatial_temp, "spatial"),
            (self.seen.spectral, &mut record.save.spectra, "spectra"),
            (self.seen.oscilloscope, &mut record.save.oscilloscope, "oscilloscope"),
            (self.seen.embedded, &mut record.save.embedded, "embedded"),
        ];
        for (seen, flag, section) in absent {
            if *flag && seen == 0 {
                warn!(section, "No readings during the run, section will not be saved");
                *flag = false;
            }
        }

        info!(
            niter = record.niter,
            overruns = record.overruns.len(),
            "Run record complete"
        );
        self.record
    }
}
