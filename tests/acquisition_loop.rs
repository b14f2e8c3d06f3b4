//! End-to-end runs against simulated instruments.
//!
//! Every test runs on a paused tokio clock, so device latencies and the
//! sampling period are exact and the runs finish instantly.

use std::sync::Arc;
use std::time::Duration;

use plasma_daq::config::{RunConfig, RunSettings};
use plasma_daq::data::archive::{ArrayArchive, EXTENSION};
use plasma_daq::data::frame_store::replay;
use plasma_daq::data::storage::{
    read_table, Artifact, ArtifactOutcome, EMBEDDED_TABLE, INPUT_OUTPUT_TABLE, SCOPE_ARCHIVE,
    SPECTRA_ARCHIVE,
};
use plasma_daq::experiment::aggregator::{READING_SENTINEL, SPECTRAL_SENTINEL};
use plasma_daq::experiment::RunEngine;
use plasma_daq::hardware::mock::{
    MockMicrocontroller, MockOscilloscope, MockSpectrometer, MockThermalCamera,
};
use plasma_daq::hardware::DeviceRegistry;
use tokio::time::Instant;

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

struct Rig {
    mcu: Arc<MockMicrocontroller>,
    registry: DeviceRegistry,
}

/// Rig with per-device latencies `[thermal, spectral, scope, embedded]`.
fn rig(latencies: [u64; 4], frame: (usize, usize)) -> Rig {
    let mcu = Arc::new(MockMicrocontroller::new(ms(latencies[3])));
    let registry = DeviceRegistry::new()
        .with_thermal(Arc::new(MockThermalCamera::new(frame.0, frame.1, ms(latencies[0]))))
        .with_spectrometer(Arc::new(MockSpectrometer::new(128, 100_000, ms(latencies[1]))))
        .with_oscilloscope(Arc::new(MockOscilloscope::new(2, 32, ms(latencies[2]))))
        .with_telemetry(mcu.clone())
        .with_actuator(mcu.clone());
    Rig { mcu, registry }
}

fn settings() -> RunSettings {
    let mut settings = RunSettings::default();
    settings.sampling_period_s = 1.0;
    settings.integration_time_us = 100_000;
    settings
}

#[tokio::test(start_paused = true)]
async fn test_fast_devices_never_overrun() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig([100, 300, 200, 150], (16, 16));
    let config = RunConfig::new(settings(), vec![2.0; 5], vec![1.5; 5]).unwrap();
    let engine = RunEngine::new(rig.registry, config).with_output_dir(dir.path());

    let start = Instant::now();
    let outcome = engine.run().await.unwrap();
    let elapsed = start.elapsed();

    assert!(outcome.record.overruns.is_empty());
    // 0.3 s probe, then five full periods
    assert!(
        elapsed >= ms(5_300) && elapsed < ms(5_400),
        "Expected ~5.3 s, got {:?}",
        elapsed
    );

    let record = &outcome.record;
    assert_eq!(record.temperature.len(), 5);
    assert_eq!(record.intensity.len(), 5);
    assert_eq!(record.power.len(), 5);
    assert_eq!(record.flow.len(), 5);
    assert!(record.temperature.iter().all(|t| (t - 45.0).abs() < 0.01));
    assert!(record.intensity.iter().all(|i| *i > 0.0));
    assert!(outcome.report.is_complete(), "{:?}", outcome.report);
}

#[tokio::test(start_paused = true)]
async fn test_slow_device_flags_every_tick_once() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig([1_200, 100, 100, 100], (8, 8));
    let config = RunConfig::new(settings(), vec![2.0; 3], vec![1.5; 3]).unwrap();
    let engine = RunEngine::new(rig.registry, config).with_output_dir(dir.path());

    let outcome = engine.run().await.unwrap();
    assert_eq!(outcome.record.overruns, vec![0, 1, 2]);

    let (_, rows) = read_table(&dir.path().join("badMeasurementTimes.csv"), false).unwrap();
    assert_eq!(rows, vec![vec![0.0], vec![1.0], vec![2.0]]);

    // overrun ticks are still recorded
    let (_, io) = read_table(&dir.path().join(INPUT_OUTPUT_TABLE), true).unwrap();
    assert_eq!(io.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_spectrometer_yields_sentinels_and_no_archive() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig([100, 100, 100, 100], (8, 8));
    let mut settings = settings();
    settings.collect.spectral = false;
    let config = RunConfig::new(settings, vec![2.0; 4], vec![1.5; 4]).unwrap();
    let engine = RunEngine::new(rig.registry, config).with_output_dir(dir.path());

    let outcome = engine.run().await.unwrap();
    assert_eq!(outcome.record.intensity, vec![SPECTRAL_SENTINEL; 4]);
    assert_eq!(
        outcome.report.outcome(Artifact::Spectra),
        Some(&ArtifactOutcome::Skipped)
    );
    assert!(!dir
        .path()
        .join(format!("{SPECTRA_ARCHIVE}.{EXTENSION}"))
        .exists());

    let (_, io) = read_table(&dir.path().join(INPUT_OUTPUT_TABLE), true).unwrap();
    assert!(io.iter().all(|row| row[1] == SPECTRAL_SENTINEL));
}

#[tokio::test(start_paused = true)]
async fn test_frames_roll_over_into_batches() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig([10, 10, 10, 10], (4, 6));
    let mut settings = settings();
    settings.frame_batch_size = 200;
    settings.collect.spectral = false;
    settings.collect.oscilloscope = false;
    let config = RunConfig::new(settings, vec![2.0; 450], vec![1.5; 450]).unwrap();
    let engine = RunEngine::new(rig.registry, config).with_output_dir(dir.path());

    let outcome = engine.run().await.unwrap();
    let batches = outcome.record.frames.clone().unwrap();

    assert_eq!(batches.paths.len(), 3);
    assert_eq!(
        (0..3).map(|b| batches.frames_in_batch(b)).collect::<Vec<_>>(),
        vec![200, 200, 50]
    );
    for (n, path) in batches.paths.iter().enumerate() {
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), format!("tmp_img_data{n}.dat"));
    }
    assert_eq!(batches.locate(449), (2, 49));

    let mut count = 0;
    replay(&batches, |i, frame| {
        assert_eq!(i, count);
        assert_eq!(frame.shape, vec![4, 6]);
        count += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(count, 450);

    let images = outcome.report.path(Artifact::Images).unwrap();
    assert!(images.join(format!("iter449.{EXTENSION}")).exists());
    assert!(!images.join(format!("iter450.{EXTENSION}")).exists());
}

#[tokio::test(start_paused = true)]
async fn test_telemetry_loss_mid_run_becomes_sentinel_rows() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig([100, 100, 100, 100], (8, 8));
    let config = RunConfig::new(settings(), vec![2.0; 4], vec![1.5; 4]).unwrap();
    let engine = RunEngine::new(rig.registry, config).with_output_dir(dir.path());

    // ticks start at 0.1 s, 1.1 s, 2.1 s and 3.1 s; corrupt everything from 1.6 s on
    let mcu = rig.mcu.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ms(1_600)).await;
        mcu.corrupt_next_lines(u64::MAX);
    });

    let outcome = engine.run().await.unwrap();
    assert!(outcome.record.overruns.is_empty());

    let (_, rows) = read_table(&dir.path().join(EMBEDDED_TABLE), true).unwrap();
    assert_eq!(rows.len(), 4);
    // the microcontroller echoes the setpoints of the previous tick
    assert_eq!(rows[1][10], 2.0);
    assert!(rows[2].iter().all(|v| *v == READING_SENTINEL));
    assert!(rows[3].iter().all(|v| *v == READING_SENTINEL));
}

#[tokio::test(start_paused = true)]
async fn test_oscilloscope_archive_matches_channel_count() {
    for channels in 1..=5 {
        let dir = tempfile::tempdir().unwrap();
        let mcu = Arc::new(MockMicrocontroller::new(ms(10)));
        let registry = DeviceRegistry::new()
            .with_oscilloscope(Arc::new(MockOscilloscope::new(channels, 16, ms(10))))
            .with_telemetry(mcu.clone())
            .with_actuator(mcu);
        let mut settings = settings();
        settings.collect.thermal = false;
        settings.collect.spectral = false;
        let config = RunConfig::new(settings, vec![2.0; 2], vec![1.5; 2]).unwrap();
        let engine = RunEngine::new(registry, config).with_output_dir(dir.path());

        let outcome = engine.run().await.unwrap();
        let archive_path = dir.path().join(format!("{SCOPE_ARCHIVE}.{EXTENSION}"));
        if channels <= 4 {
            let archive = ArrayArchive::read(&archive_path).unwrap();
            let expected: Vec<String> = ["chA", "chB", "chC", "chD"]
                .iter()
                .take(channels)
                .map(|s| s.to_string())
                .collect();
            assert_eq!(archive.names(), expected);
            // timebase row plus one row per tick
            assert_eq!(archive.get("chA").unwrap().shape, vec![3, 16]);
        } else {
            assert!(matches!(
                outcome.report.outcome(Artifact::Oscilloscope),
                Some(ArtifactOutcome::Failed(_))
            ));
            assert!(!archive_path.exists());
            // the other artifacts are still written
            assert!(outcome.report.path(Artifact::InputOutput).is_some());
            assert!(outcome.report.path(Artifact::Embedded).is_some());
        }
    }
}
