//! RunEngine for executing one acquisition run.
//!
//! The engine owns the tick loop:
//!
//! ```text
//! probe → [ sample all devices → store frame → actuate → fold → deadline ] × Niter
//!       → shutdown actuation → backup + artifacts
//! ```
//!
//! Sampling strictly precedes actuation within a tick, and actuation of tick
//! `i` strictly precedes sampling of tick `i + 1`. A failed actuation is an
//! unrecoverable driver fault: the loop stops, the jet is switched off on a
//! best-effort basis and the error is returned.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{RunConfig, StorageSettings};
use crate::data::frame_store::{FrameBatches, FrameStore};
use crate::data::storage::{PersistReport, Persister};
use crate::error::{AppResult, DaqError};
use crate::experiment::aggregator::{Aggregator, RunRecord, SPECTRAL_SENTINEL, TEMPERATURE_SENTINEL};
use crate::experiment::sampler::{ConcurrentSampler, SampleSet};
use crate::experiment::scheduler::DeadlineScheduler;
use crate::hardware::{DeviceRegistry, Frame, PixelType};

/// Result of a completed run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Run record with its bulk matrices released.
    pub record: RunRecord,
    /// Per-artifact persistence outcome.
    pub report: PersistReport,
    /// Directory holding every artifact of the run.
    pub output_dir: PathBuf,
}

/// Timestamped run directory under the configured output root.
pub fn run_directory(storage: &StorageSettings) -> PathBuf {
    storage.output_dir.join(format!(
        "{}_{}",
        Utc::now().format("%Y-%m-%d_%H.%M.%S"),
        storage.run_label
    ))
}

/// Executes one run against a device registry.
pub struct RunEngine {
    registry: DeviceRegistry,
    config: Arc<RunConfig>,
    output_dir: PathBuf,
}

impl RunEngine {
    /// Engine for `config`, writing into a fresh timestamped run directory.
    pub fn new(registry: DeviceRegistry, config: RunConfig) -> Self {
        let output_dir = run_directory(&config.settings().storage);
        Self {
            registry,
            config: Arc::new(config),
            output_dir,
        }
    }

    /// Write artifacts into `dir` instead of a timestamped directory.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Output directory of this run.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Execute the run to completion.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - A collected device or the actuator is not registered
    /// - The output directory cannot be created
    /// - An actuation command fails during the loop
    pub async fn run(&self) -> AppResult<RunOutcome> {
        self.registry.validate(&self.config)?;
        fs::create_dir_all(&self.output_dir)?;

        let settings = self.config.settings();
        let niter = self.config.niter();
        let duty = settings.duty_cycle;
        let sampler = ConcurrentSampler::new(self.registry.clone(), self.config.clone());
        let mut scheduler = DeadlineScheduler::new(self.config.sampling_period());

        info!(
            niter,
            period_s = settings.sampling_period_s,
            dir = %self.output_dir.display(),
            "Starting run"
        );

        let probe = sampler.sample_tick().await;
        info!(
            elapsed_ms = probe.elapsed.as_millis() as u64,
            unavailable = ?probe.unavailable(),
            "Probe measurement complete"
        );
        let mut aggregator = Aggregator::new(&self.config, &probe);
        let mut frames = self.open_frame_store(&aggregator, &probe)?;
        let mut closed = None;
        drop(probe);

        aggregator.mark_started();
        for i in 0..niter {
            let tick_start = Instant::now();
            let mut set = sampler.sample_tick().await;

            if let Some(store) = frames.as_mut() {
                if let Err(e) = store_frame(store, i, &mut set) {
                    error!(
                        tick = i,
                        error = %e,
                        "Frame store failed, keeping the frames written so far"
                    );
                    closed = frames.take().and_then(close_frame_store);
                }
            }

            let (power, flow) = (self.config.power()[i], self.config.flow()[i]);
            if let Err(e) = self.registry.actuate(power, flow, duty).await {
                error!(tick = i, error = %e, "Actuation failed, shutting the jet down");
                self.shutdown(duty).await;
                return Err(e);
            }

            aggregator.fold(i, &set, power, flow);
            info!(
                tick = i,
                ts = set.thermal().map_or(TEMPERATURE_SENTINEL, |t| t.max_temperature),
                intensity = set.spectral().map_or(SPECTRAL_SENTINEL, |s| s.total_intensity),
                power,
                flow,
                elapsed_ms = tick_start.elapsed().as_millis() as u64,
                "Tick complete"
            );

            scheduler.finish_tick(i, tick_start).await;
        }

        self.shutdown(duty).await;

        let batches = closed.or_else(|| frames.and_then(close_frame_store));
        let record = aggregator.finish(scheduler.into_overruns(), batches);

        let (report, mut record) = self.persist(record).await?;
        for artifact in report.failures() {
            warn!(artifact = %artifact, "Artifact was not saved");
        }
        record.release_bulk();

        info!(
            niter,
            overruns = record.overruns.len(),
            dir = %self.output_dir.display(),
            "Run complete"
        );
        Ok(RunOutcome {
            record,
            report,
            output_dir: self.output_dir.clone(),
        })
    }

    fn open_frame_store(&self, aggregator: &Aggregator, probe: &SampleSet) -> AppResult<Option<FrameStore>> {
        if !aggregator.save_flags().images {
            return Ok(None);
        }
        let Some(frame) = probe.thermal().and_then(|t| t.raw_frame.as_ref()) else {
            return Ok(None);
        };
        let store = FrameStore::new(
            &self.output_dir,
            self.config.settings().frame_batch_size,
            frame.pixel_type(),
            frame.shape.clone(),
        )?;
        Ok(Some(store))
    }

    /// Switch the jet off. Failures are logged; the data is still saved.
    async fn shutdown(&self, duty: f64) {
        match self.registry.actuate(0.0, 0.0, duty).await {
            Ok(()) => info!("Plasma shut down"),
            Err(e) => error!(error = %e, "Shutdown actuation failed, switch the jet off manually"),
        }
    }

    async fn persist(&self, record: RunRecord) -> AppResult<(PersistReport, RunRecord)> {
        let persister = Persister::new(&self.output_dir);
        tokio::task::spawn_blocking(move || {
            let report = persister.persist(&record)?;
            Ok::<_, DaqError>((report, record))
        })
        .await
        .map_err(|e| DaqError::Storage(format!("persistence task failed: {e}")))?
    }
}

/// Close the store, keeping the descriptor of every frame written so far.
fn close_frame_store(store: FrameStore) -> Option<FrameBatches> {
    match store.finish() {
        Ok(batches) => Some(batches),
        Err(e) => {
            error!(error = %e, "Failed to close frame store");
            None
        }
    }
}

/// Store the tick's frame, substituting a blank frame when the camera gave none.
fn store_frame(store: &mut FrameStore, index: usize, set: &mut SampleSet) -> AppResult<()> {
    let (dtype, shape): (PixelType, Vec<usize>) = store.layout();
    let frame = match set.take_frame() {
        Some(frame) if frame.pixel_type() == dtype && frame.shape == shape => frame,
        Some(frame) => {
            warn!(tick = index, shape = ?frame.shape, "Frame layout changed, storing a blank frame");
            Frame::zeros(dtype, &shape)
        }
        None => Frame::zeros(dtype, &shape),
    };
    store.write(index, &frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::RunSettings;
    use crate::data::archive::EXTENSION;
    use crate::data::frame_store::batch_path;
    use crate::data::storage::{backup_path, read_backup, Artifact};
    use crate::hardware::mock::MockRig;
    use crate::hardware::{DeviceKind, RequiredDevice};

    fn settings(dir: &Path) -> RunSettings {
        let mut settings = RunSettings::default();
        settings.sampling_period_s = 1.0;
        settings.integration_time_us = 100_000;
        settings.frame_batch_size = 4;
        settings.storage.output_dir = dir.to_path_buf();
        settings
    }

    #[tokio::test(start_paused = true)]
    async fn actuation_fault_stops_the_run_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let rig = MockRig::new(Duration::from_millis(50));
        let config = RunConfig::new(settings(dir.path()), vec![2.0; 5], vec![1.0; 5]).unwrap();
        let engine = RunEngine::new(rig.registry(), config).with_output_dir(dir.path().join("run"));

        rig.microcontroller.fail_actuation(true);
        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, DaqError::Driver(_)), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn frames_written_before_a_store_failure_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let run_dir = dir.path().join("run");
        // a directory where the second batch file should go makes its creation fail
        fs::create_dir_all(batch_path(&run_dir, 1)).unwrap();

        let rig = MockRig::new(Duration::from_millis(50));
        let mut settings = settings(dir.path());
        settings.frame_batch_size = 2;
        let label = settings.storage.run_label.clone();
        let config = RunConfig::new(settings, vec![2.0; 5], vec![1.0; 5]).unwrap();
        let engine = RunEngine::new(rig.registry(), config).with_output_dir(&run_dir);

        let outcome = engine.run().await.unwrap();
        let frames = outcome.record.frames.as_ref().unwrap();
        assert_eq!(frames.frame_count, 2);
        assert_eq!(frames.paths, vec![batch_path(&run_dir, 0)]);
        assert!(outcome.record.save.images);

        let images = outcome.report.path(Artifact::Images).unwrap();
        assert!(images.join(format!("iter0.{EXTENSION}")).exists());
        assert!(images.join(format!("iter1.{EXTENSION}")).exists());
        assert!(!images.join(format!("iter2.{EXTENSION}")).exists());

        let backup = read_backup(&backup_path(&run_dir, &label)).unwrap();
        assert_eq!(backup.frames.unwrap().frame_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_device_is_fatal_before_any_tick() {
        let dir = tempfile::tempdir().unwrap();
        let rig = MockRig::new(Duration::ZERO);
        let registry = DeviceRegistry::new()
            .with_thermal(rig.camera.clone())
            .with_actuator(rig.microcontroller.clone());
        let config = RunConfig::new(settings(dir.path()), vec![2.0; 3], vec![1.0; 3]).unwrap();
        let engine = RunEngine::new(registry, config).with_output_dir(dir.path().join("run"));

        let err = engine.run().await.unwrap_err();
        assert!(matches!(
            err,
            DaqError::MissingDevice(RequiredDevice::Instrument(DeviceKind::Spectral))
        ));
        assert!(rig.microcontroller.actuations().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn every_tick_is_actuated_then_the_jet_is_switched_off() {
        let dir = tempfile::tempdir().unwrap();
        let rig = MockRig::new(Duration::from_millis(100));
        let config = RunConfig::new(settings(dir.path()), vec![2.0, 2.5, 3.0], vec![1.0, 1.5, 2.0]).unwrap();
        let engine = RunEngine::new(rig.registry(), config).with_output_dir(dir.path().join("run"));

        let outcome = engine.run().await.unwrap();
        assert_eq!(
            rig.microcontroller.actuations().await,
            vec![(2.0, 1.0, 100.0), (2.5, 1.5, 100.0), (3.0, 2.0, 100.0), (0.0, 0.0, 100.0)]
        );
        assert_eq!(outcome.record.power, vec![2.0, 2.5, 3.0]);
        assert!(outcome.record.overruns.is_empty());
        assert_eq!(outcome.record.frames.as_ref().unwrap().frame_count, 3);
        assert!(outcome.report.is_complete(), "{:?}", outcome.report);
    }
}
