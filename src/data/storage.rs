//! Run persistence.
//!
//! At the end of a run the [`Persister`] first writes an atomic JSON backup of
//! the whole [`RunRecord`], then one artifact per kind. Every artifact is
//! attempted independently and its outcome recorded in a [`PersistReport`];
//! one failing writer never stops the others.
//!
//! Tables are CSV and need the `storage_csv` feature; spectra, oscilloscope
//! traces and frames go into compressed archives (see [`crate::data::archive`]).

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{error, info};

use crate::data::archive::{ArrayArchive, EXTENSION};
use crate::data::frame_store::export_frames;
use crate::error::{AppResult, DaqError};
use crate::experiment::aggregator::RunRecord;

/// Combined input/output table.
pub const INPUT_OUTPUT_TABLE: &str = "inputOutputData.csv";
/// Overrun tick indices, one per line.
pub const OVERRUN_LIST: &str = "badMeasurementTimes.csv";
/// Spatial temperature table.
pub const SPATIAL_TABLE: &str = "dataCollectionSpatialTemps.csv";
/// Embedded telemetry table.
pub const EMBEDDED_TABLE: &str = "dataCollectionEmbedded.csv";
/// Spectral archive stem.
pub const SPECTRA_ARCHIVE: &str = "dataCollectionSpectra";
/// Oscilloscope archive stem.
pub const SCOPE_ARCHIVE: &str = "dataCollectionOscilloscope";
/// Directory holding one archive per frame.
pub const IMAGES_DIR: &str = "images";
/// Human-readable run notes.
pub const NOTES_FILE: &str = "notes.txt";

/// Header of the combined input/output table.
pub const INPUT_OUTPUT_HEADER: [&str; 4] = ["Ts (degC)", "I (a.u.)", "P (W)", "q (slm)"];

/// Header of the spatial temperature table.
pub const SPATIAL_HEADER: [&str; 3] = ["Ts (degC)", "Ts2 (degC)", "Ts3 (degC)"];

/// Header of the embedded telemetry table.
pub const EMBEDDED_HEADER: [&str; 14] = [
    "t_emb (ms)",
    "Isemb (a.u.)",
    "Vp2p (V)",
    "f (kHz)",
    "q (slm)",
    "x_pos (mm)",
    "y_pos (mm)",
    "dsep (mm)",
    "T_emb (K)",
    "P_emb (W)",
    "Pset (W)",
    "duty (%)",
    "V_emb (kV)",
    "I_emb (mA)",
];

/// Most oscilloscope channels an archive can hold.
pub const MAX_SCOPE_CHANNELS: usize = 4;

/// Backup snapshot path for a run label.
pub fn backup_path(dir: &Path, run_label: &str) -> PathBuf {
    dir.join(format!("{run_label}_backup.json"))
}

/// Persisted artifact kinds.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Artifact {
    Backup,
    InputOutput,
    Overruns,
    Spatial,
    Spectra,
    Oscilloscope,
    Embedded,
    Images,
    Notes,
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Artifact::Backup => "backup",
            Artifact::InputOutput => "input_output",
            Artifact::Overruns => "overruns",
            Artifact::Spatial => "spatial",
            Artifact::Spectra => "spectra",
            Artifact::Oscilloscope => "oscilloscope",
            Artifact::Embedded => "embedded",
            Artifact::Images => "images",
            Artifact::Notes => "notes",
        };
        f.write_str(label)
    }
}

/// What happened to one artifact.
#[derive(Debug, Clone, PartialEq)]
pub enum ArtifactOutcome {
    /// Written to `path`.
    Written {
        /// Output file or directory.
        path: PathBuf,
        /// Time spent writing.
        duration: Duration,
    },
    /// Not requested, or its source was absent.
    Skipped,
    /// Writer failed; the message is the error.
    Failed(String),
}

/// Outcome of every artifact of a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistReport {
    outcomes: BTreeMap<Artifact, ArtifactOutcome>,
}

impl PersistReport {
    /// Outcome for `artifact`, if it was considered.
    pub fn outcome(&self, artifact: Artifact) -> Option<&ArtifactOutcome> {
        self.outcomes.get(&artifact)
    }

    /// Path written for `artifact`.
    pub fn path(&self, artifact: Artifact) -> Option<&Path> {
        match self.outcomes.get(&artifact) {
            Some(ArtifactOutcome::Written { path, .. }) => Some(path),
            _ => None,
        }
    }

    /// Artifacts that failed.
    pub fn failures(&self) -> Vec<Artifact> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ArtifactOutcome::Failed(_)))
            .map(|(a, _)| *a)
            .collect()
    }

    /// True when nothing failed.
    pub fn is_complete(&self) -> bool {
        self.failures().is_empty()
    }

    /// Iterate over all outcomes in artifact order.
    pub fn iter(&self) -> impl Iterator<Item = (&Artifact, &ArtifactOutcome)> {
        self.outcomes.iter()
    }
}

/// Writes a run's artifacts into one directory.
#[derive(Debug, Clone)]
pub struct Persister {
    dir: PathBuf,
}

impl Persister {
    /// Persister writing into `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Output directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the backup snapshot, then every artifact.
    pub fn persist(&self, record: &RunRecord) -> AppResult<PersistReport> {
        fs::create_dir_all(&self.dir)?;
        let mut report = PersistReport::default();
        self.attempt(&mut report, Artifact::Backup, true, || self.write_backup(record));
        self.persist_into(&mut report, record);
        Ok(report)
    }

    /// Write every artifact except the backup.
    pub fn persist_artifacts(&self, record: &RunRecord) -> AppResult<PersistReport> {
        fs::create_dir_all(&self.dir)?;
        let mut report = PersistReport::default();
        self.persist_into(&mut report, record);
        Ok(report)
    }

    fn persist_into(&self, report: &mut PersistReport, record: &RunRecord) {
        let save = record.save;
        self.attempt(report, Artifact::InputOutput, save.data, || {
            self.write_input_output(record)
        });
        self.attempt(report, Artifact::Overruns, save.data, || self.write_overruns(record));
        self.attempt(report, Artifact::Spatial, save.spatial_temp, || {
            self.write_spatial(record)
        });
        self.attempt(report, Artifact::Spectra, save.spectra, || self.write_spectra(record));
        self.attempt(report, Artifact::Oscilloscope, save.oscilloscope, || {
            self.write_oscilloscope(record)
        });
        self.attempt(report, Artifact::Embedded, save.embedded, || {
            self.write_embedded(record)
        });
        self.attempt(report, Artifact::Images, save.images, || self.write_images(record));
        self.attempt(report, Artifact::Notes, true, || self.write_notes(record));
    }

    fn attempt<F>(&self, report: &mut PersistReport, artifact: Artifact, enabled: bool, write: F)
    where
        F: FnOnce() -> AppResult<PathBuf>,
    {
        if !enabled {
            report.outcomes.insert(artifact, ArtifactOutcome::Skipped);
            return;
        }

        let started = Instant::now();
        let outcome = match write() {
            Ok(path) => {
                let duration = started.elapsed();
                info!(
                    artifact = %artifact,
                    path = %path.display(),
                    elapsed_ms = duration.as_millis() as u64,
                    "Artifact written"
                );
                ArtifactOutcome::Written { path, duration }
            }
            Err(e) => {
                error!(artifact = %artifact, error = %e, "Artifact failed");
                ArtifactOutcome::Failed(e.to_string())
            }
        };
        report.outcomes.insert(artifact, outcome);
    }

    /// Atomically write the JSON backup snapshot.
    ///
    /// The snapshot is written to a temporary file, synced and renamed over
    /// the final path, so a crash leaves either the old file or the new one.
    pub fn write_backup(&self, record: &RunRecord) -> AppResult<PathBuf> {
        let path = backup_path(&self.dir, &record.run_label);
        let tmp = path.with_extension("json.tmp");

        let mut writer = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, record)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    fn write_input_output(&self, record: &RunRecord) -> AppResult<PathBuf> {
        let path = self.dir.join(INPUT_OUTPUT_TABLE);
        let rows = (0..record.niter).map(|i| {
            [
                record.temperature[i],
                record.intensity[i],
                record.power[i],
                record.flow[i],
            ]
        });
        write_table(&path, Some(INPUT_OUTPUT_HEADER.as_slice()), rows)?;
        Ok(path)
    }

    fn write_overruns(&self, record: &RunRecord) -> AppResult<PathBuf> {
        let path = self.dir.join(OVERRUN_LIST);
        let rows = record.overruns.iter().map(|&i| [i as f64]);
        write_table(&path, None, rows)?;
        Ok(path)
    }

    fn write_spatial(&self, record: &RunRecord) -> AppResult<PathBuf> {
        let spatial = record
            .spatial
            .as_ref()
            .ok_or_else(|| DaqError::Storage("no spatial temperatures recorded".to_string()))?;
        let path = self.dir.join(SPATIAL_TABLE);
        let rows = (0..record.niter).map(|i| [record.temperature[i], spatial.ts2[i], spatial.ts3[i]]);
        write_table(&path, Some(SPATIAL_HEADER.as_slice()), rows)?;
        Ok(path)
    }

    fn write_spectra(&self, record: &RunRecord) -> AppResult<PathBuf> {
        let spectra = record
            .spectra
            .as_ref()
            .ok_or_else(|| DaqError::Storage("no spectra recorded".to_string()))?;
        if spectra.intensities.len() != record.niter {
            return Err(DaqError::Storage(format!(
                "spectra hold {} rows for {} ticks",
                spectra.intensities.len(),
                record.niter
            )));
        }

        let mut archive = ArrayArchive::new();
        archive.insert_vector("wavelengths", spectra.wavelengths.clone())?;
        archive.insert_matrix("intensities", &spectra.intensities)?;
        archive.insert_vector("meanShifts", spectra.mean_shifts.clone())?;

        let path = self.dir.join(format!("{SPECTRA_ARCHIVE}.{EXTENSION}"));
        archive.write(&path)?;
        Ok(path)
    }

    fn write_oscilloscope(&self, record: &RunRecord) -> AppResult<PathBuf> {
        let scope = record
            .oscilloscope
            .as_ref()
            .ok_or_else(|| DaqError::Storage("no oscilloscope traces recorded".to_string()))?;
        let archive = scope_archive(&scope.timebase, &scope.channels)?;

        let path = self.dir.join(format!("{SCOPE_ARCHIVE}.{EXTENSION}"));
        archive.write(&path)?;
        Ok(path)
    }

    fn write_embedded(&self, record: &RunRecord) -> AppResult<PathBuf> {
        let rows = record
            .embedded
            .as_ref()
            .ok_or_else(|| DaqError::Storage("no embedded telemetry recorded".to_string()))?;
        let path = self.dir.join(EMBEDDED_TABLE);
        write_table(&path, Some(EMBEDDED_HEADER.as_slice()), rows.iter().copied())?;
        Ok(path)
    }

    fn write_images(&self, record: &RunRecord) -> AppResult<PathBuf> {
        let frames = record
            .frames
            .as_ref()
            .ok_or_else(|| DaqError::Storage("no frame batches recorded".to_string()))?;
        let out = self.dir.join(IMAGES_DIR);
        let count = export_frames(frames, &out)?;
        info!(frames = count, "Frames exported");
        Ok(out)
    }

    fn write_notes(&self, record: &RunRecord) -> AppResult<PathBuf> {
        let path = self.dir.join(NOTES_FILE);
        let mut file = BufWriter::new(File::create(&path)?);
        writeln!(file, "run_label: {}", record.run_label)?;
        writeln!(file, "started_at: {}", record.started_at.to_rfc3339())?;
        writeln!(file, "niter: {}", record.niter)?;
        writeln!(file, "sampling_period_s: {}", record.sampling_period_s)?;
        writeln!(file, "overruns: {}", record.overruns.len())?;
        for (key, value) in &record.metadata {
            writeln!(file, "{key}: {value}")?;
        }
        file.flush()?;
        Ok(path)
    }
}

/// Build the oscilloscope archive: one `ch<letter>` matrix per channel with
/// the timebase as row 0 followed by one row per tick.
pub fn scope_archive(
    timebase: &[f64],
    channels: &BTreeMap<String, Vec<Vec<f64>>>,
) -> AppResult<ArrayArchive> {
    if channels.is_empty() || channels.len() > MAX_SCOPE_CHANNELS {
        return Err(DaqError::ChannelCount(channels.len()));
    }

    let mut archive = ArrayArchive::new();
    for (letter, rows) in channels {
        let mut matrix = Vec::with_capacity(rows.len() + 1);
        matrix.push(timebase.to_vec());
        matrix.extend(rows.iter().cloned());
        archive.insert_matrix(format!("ch{letter}"), &matrix)?;
    }
    Ok(archive)
}

/// Regenerate every artifact from a backup snapshot into `out_dir`.
pub fn resave_from_backup(backup: &Path, out_dir: &Path) -> AppResult<PersistReport> {
    let record = read_backup(backup)?;
    info!(
        backup = %backup.display(),
        out = %out_dir.display(),
        niter = record.niter,
        "Resaving run from backup"
    );
    Persister::new(out_dir).persist_artifacts(&record)
}

/// Load a backup snapshot.
pub fn read_backup(path: &Path) -> AppResult<RunRecord> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

#[cfg(feature = "storage_csv")]
fn write_table<I, R>(path: &Path, header: Option<&[&str]>, rows: I) -> AppResult<()>
where
    I: IntoIterator<Item = R>,
    R: AsRef<[f64]>,
{
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| DaqError::Storage(format!("Failed to create {}: {}", path.display(), e)))?;
    if let Some(header) = header {
        writer
            .write_record(header)
            .map_err(|e| DaqError::Storage(e.to_string()))?;
    }
    for row in rows {
        writer
            .write_record(row.as_ref().iter().map(|v| v.to_string()))
            .map_err(|e| DaqError::Storage(e.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(not(feature = "storage_csv"))]
fn write_table<I, R>(_path: &Path, _header: Option<&[&str]>, _rows: I) -> AppResult<()>
where
    I: IntoIterator<Item = R>,
    R: AsRef<[f64]>,
{
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
}

/// Read a numeric table written by the persister.
///
/// Returns the header (empty when `has_header` is false) and the rows.
#[cfg(feature = "storage_csv")]
pub fn read_table(path: &Path, has_header: bool) -> AppResult<(Vec<String>, Vec<Vec<f64>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_header)
        .from_path(path)
        .map_err(|e| DaqError::Storage(format!("Failed to open {}: {}", path.display(), e)))?;

    let header = if has_header {
        reader
            .headers()
            .map_err(|e| DaqError::Storage(e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| DaqError::Storage(e.to_string()))?;
        let row = record
            .iter()
            .map(|field| {
                field
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| DaqError::Storage(format!("bad value '{}': {}", field, e)))
            })
            .collect::<AppResult<Vec<f64>>>()?;
        rows.push(row);
    }
    Ok((header, rows))
}

/// Read a numeric table written by the persister.
#[cfg(not(feature = "storage_csv"))]
pub fn read_table(_path: &Path, _has_header: bool) -> AppResult<(Vec<String>, Vec<Vec<f64>>)> {
    Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
}

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::config::SaveFlags;

    fn record(niter: usize) -> RunRecord {
        RunRecord {
            run_label: "test_run".to_string(),
            started_at: chrono::Utc::now(),
            sampling_period_s: 1.0,
            niter,
            temperature: (0..niter).map(|i| 30.0 + i as f64 * 0.5).collect(),
            intensity: vec![-1.0; niter],
            power: vec![2.5; niter],
            flow: vec![1.75; niter],
            overruns: vec![1],
            spatial: None,
            spectra: None,
            oscilloscope: None,
            embedded: Some(
                (0..niter)
                    .map(|i| {
                        let mut row = [0.0; 14];
                        row[0] = 1000.0 * i as f64;
                        row[11] = 100.0;
                        row
                    })
                    .collect(),
            ),
            frames: None,
            save: SaveFlags {
                spatial_temp: false,
                spectra: false,
                oscilloscope: false,
                images: false,
                ..SaveFlags::default()
            },
            metadata: BTreeMap::from([("operator".to_string(), "lab".to_string())]),
        }
    }

    #[test]
    fn tables_read_back_with_their_headers() {
        let dir = tempfile::tempdir().unwrap();
        let record = record(3);
        let report = Persister::new(dir.path()).persist(&record).unwrap();
        assert!(report.is_complete(), "{:?}", report);

        let (header, rows) = read_table(&dir.path().join(INPUT_OUTPUT_TABLE), true).unwrap();
        assert_eq!(header, INPUT_OUTPUT_HEADER);
        assert_eq!(rows.len(), 3);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(
                row,
                &vec![record.temperature[i], record.intensity[i], record.power[i], record.flow[i]]
            );
        }

        let (header, rows) = read_table(&dir.path().join(EMBEDDED_TABLE), true).unwrap();
        assert_eq!(header, EMBEDDED_HEADER);
        let expected: Vec<Vec<f64>> = record.embedded.unwrap().iter().map(|r| r.to_vec()).collect();
        assert_eq!(rows, expected);

        let (_, overruns) = read_table(&dir.path().join(OVERRUN_LIST), false).unwrap();
        assert_eq!(overruns, vec![vec![1.0]]);
    }

    #[test]
    fn disabled_artifacts_are_skipped_and_backup_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let record = record(2);
        let report = Persister::new(dir.path()).persist(&record).unwrap();

        assert_eq!(report.outcome(Artifact::Spectra), Some(&ArtifactOutcome::Skipped));
        assert!(!dir.path().join(format!("{SPECTRA_ARCHIVE}.{EXTENSION}")).exists());

        let backup = report.path(Artifact::Backup).unwrap();
        assert_eq!(backup, backup_path(dir.path(), "test_run"));
        assert!(!backup.with_extension("json.tmp").exists());
        assert_eq!(read_backup(backup).unwrap(), record);
    }

    #[test]
    fn one_failing_artifact_does_not_stop_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = record(2);
        // asked for, but never recorded
        record.save.spectra = true;
        let report = Persister::new(dir.path()).persist(&record).unwrap();

        assert_eq!(report.failures(), vec![Artifact::Spectra]);
        assert!(report.path(Artifact::Embedded).is_some());
        assert!(report.path(Artifact::Notes).is_some());
    }

    #[test]
    fn scope_archive_keys_follow_channel_count() {
        for count in 1..=4 {
            let channels: BTreeMap<String, Vec<Vec<f64>>> = ['A', 'B', 'C', 'D']
                .iter()
                .take(count)
                .map(|c| (c.to_string(), vec![vec![0.5; 3]; 2]))
                .collect();
            let archive = scope_archive(&[0.0, 1.0, 2.0], &channels).unwrap();
            let expected: Vec<String> = ['A', 'B', 'C', 'D']
                .iter()
                .take(count)
                .map(|c| format!("ch{c}"))
                .collect();
            assert_eq!(archive.names(), expected);
            let ch_a = archive.get("chA").unwrap();
            assert_eq!(ch_a.shape, vec![3, 3]);
            assert_eq!(ch_a.row(0).unwrap(), &[0.0, 1.0, 2.0]);
        }

        let five: BTreeMap<String, Vec<Vec<f64>>> = ['A', 'B', 'C', 'D', 'E']
            .iter()
            .map(|c| (c.to_string(), vec![vec![0.0; 3]]))
            .collect();
        assert!(matches!(
            scope_archive(&[0.0, 1.0, 2.0], &five),
            Err(DaqError::ChannelCount(5))
        ));
        assert!(matches!(
            scope_archive(&[0.0], &BTreeMap::new()),
            Err(DaqError::ChannelCount(0))
        ));
    }

    #[test]
    fn resave_rebuilds_tables_from_the_backup() {
        let dir = tempfile::tempdir().unwrap();
        let record = record(4);
        let backup = Persister::new(dir.path()).write_backup(&record).unwrap();

        let out = dir.path().join("resaved");
        let report = resave_from_backup(&backup, &out).unwrap();
        assert!(report.outcome(Artifact::Backup).is_none());
        let (_, rows) = read_table(&out.join(INPUT_OUTPUT_TABLE), true).unwrap();
        assert_eq!(rows.len(), 4);
    }
}
