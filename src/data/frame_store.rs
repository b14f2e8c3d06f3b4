#![allow(unsafe_code)]
//! Memory-mapped frame batches.
//!
//! Raw thermal frames are too large to keep for a whole run, so they are
//! written into fixed-capacity batch files of `N` frames each. A batch file
//! has the layout `(N, *frame_shape)` of the declared pixel type,
//! little-endian, and frame `i` lives in batch `i / N` at slot `i % N`.
//!
//! Only one batch is mapped at a time. Reaching a batch boundary flushes and
//! unmaps the active batch before the next file is created, and an earlier
//! batch is never reopened for writing. The final batch keeps its full file
//! size; [`FrameBatches::frame_count`] bounds every replay.
//!
//! # Safety
//!
//! Batch files are created by this process and never resized while mapped;
//! replay maps them read-only after the writer has released them.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::Context;
use memmap2::{Mmap, MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::data::archive::{ArrayArchive, EXTENSION};
use crate::error::{AppResult, DaqError};
use crate::hardware::{Frame, PixelType};

/// Descriptor of a run's frame batches, as stored in the backup snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameBatches {
    /// Batch files in batch order.
    pub paths: Vec<PathBuf>,
    /// Pixel type of every frame.
    pub dtype: PixelType,
    /// Shape of one frame.
    pub shape: Vec<usize>,
    /// Frames per batch file.
    pub batch_size: usize,
    /// Frames actually written.
    pub frame_count: usize,
}

impl FrameBatches {
    /// Batch index and slot of frame `index`.
    pub fn locate(&self, index: usize) -> (usize, usize) {
        (index / self.batch_size, index % self.batch_size)
    }

    /// Frames held by batch `batch`.
    pub fn frames_in_batch(&self, batch: usize) -> usize {
        let start = batch * self.batch_size;
        self.frame_count.saturating_sub(start).min(self.batch_size)
    }

    /// Size of one frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.size_bytes()
    }
}

/// Path of batch `n` inside `dir`.
pub fn batch_path(dir: &Path, n: usize) -> PathBuf {
    dir.join(format!("tmp_img_data{n}.dat"))
}

struct ActiveBatch {
    index: usize,
    mmap: MmapMut,
}

/// Sequential writer of frame batches.
pub struct FrameStore {
    dir: PathBuf,
    batch_size: usize,
    dtype: PixelType,
    shape: Vec<usize>,
    frame_bytes: usize,
    active: Option<ActiveBatch>,
    paths: Vec<PathBuf>,
    written: usize,
}

impl FrameStore {
    /// Store writing batches of `batch_size` frames into `dir`.
    pub fn new(dir: impl Into<PathBuf>, batch_size: usize, dtype: PixelType, shape: Vec<usize>) -> AppResult<Self> {
        let dir = dir.into();
        if batch_size == 0 {
            return Err(DaqError::FrameLayout("batch size must be at least 1".to_string()));
        }
        let frame_bytes = shape.iter().product::<usize>() * dtype.size_bytes();
        if frame_bytes == 0 {
            return Err(DaqError::FrameLayout(format!("empty frame shape {:?}", shape)));
        }
        fs::create_dir_all(&dir)?;

        Ok(Self {
            dir,
            batch_size,
            dtype,
            shape,
            frame_bytes,
            active: None,
            paths: Vec::new(),
            written: 0,
        })
    }

    /// Pixel type and shape every frame must have.
    pub fn layout(&self) -> (PixelType, Vec<usize>) {
        (self.dtype, self.shape.clone())
    }

    /// Frames written so far.
    pub fn frame_count(&self) -> usize {
        self.written
    }

    /// Write frame `index`, which must be the next frame in sequence.
    pub fn write(&mut self, index: usize, frame: &Frame) -> AppResult<()> {
        if index != self.written {
            return Err(DaqError::FrameLayout(format!(
                "frames must be written in order: expected {}, got {}",
                self.written, index
            )));
        }
        if frame.pixel_type() != self.dtype || frame.shape != self.shape {
            return Err(DaqError::FrameLayout(format!(
                "frame {} is {:?} {:?}, store holds {:?} {:?}",
                index,
                frame.pixel_type(),
                frame.shape,
                self.dtype,
                self.shape
            )));
        }

        let (batch, slot) = (index / self.batch_size, index % self.batch_size);
        if slot == 0 {
            self.open_batch(batch)?;
        }
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| DaqError::FrameLayout(format!("no open batch for frame {index}")))?;
        let offset = slot * self.frame_bytes;
        frame.write_le(&mut active.mmap[offset..offset + self.frame_bytes]);

        self.written += 1;
        Ok(())
    }

    fn open_batch(&mut self, batch: usize) -> AppResult<()> {
        self.release_active()?;

        let path = batch_path(&self.dir, batch);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to create batch file {}", path.display()))
            .map_err(|e| DaqError::Storage(format!("{e:#}")))?;
        file.set_len((self.batch_size * self.frame_bytes) as u64)?;

        // SAFETY: the file was just created with its final length and is only
        // accessed through this mapping until it is released.
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };

        debug!(batch, path = %path.display(), "Opened frame batch");
        self.paths.push(path);
        self.active = Some(ActiveBatch { index: batch, mmap });
        Ok(())
    }

    fn release_active(&mut self) -> AppResult<()> {
        if let Some(active) = self.active.take() {
            active.mmap.flush()?;
            debug!(batch = active.index, "Released frame batch");
        }
        Ok(())
    }

    /// Flush the last batch and describe what was written.
    pub fn finish(mut self) -> AppResult<FrameBatches> {
        self.release_active()?;
        info!(
            frames = self.written,
            batches = self.paths.len(),
            "Frame store closed"
        );
        Ok(FrameBatches {
            paths: std::mem::take(&mut self.paths),
            dtype: self.dtype,
            shape: std::mem::take(&mut self.shape),
            batch_size: self.batch_size,
            frame_count: self.written,
        })
    }
}

/// Visit every stored frame in order, stopping at the true frame count.
pub fn replay<F>(batches: &FrameBatches, mut visit: F) -> AppResult<()>
where
    F: FnMut(usize, Frame) -> AppResult<()>,
{
    let frame_bytes = batches.frame_bytes();
    for (batch, path) in batches.paths.iter().enumerate() {
        let count = batches.frames_in_batch(batch);
        if count == 0 {
            break;
        }
        let file = File::open(path)
            .with_context(|| format!("Failed to open batch file {}", path.display()))
            .map_err(|e| DaqError::Storage(format!("{e:#}")))?;

        // SAFETY: replay happens after the writer released the batch; the
        // mapping is read-only.
        let mmap: Mmap = unsafe { MmapOptions::new().map(&file)? };
        if mmap.len() < count * frame_bytes {
            return Err(DaqError::FrameLayout(format!(
                "batch {} holds {} bytes, {} frames need {}",
                path.display(),
                mmap.len(),
                count,
                count * frame_bytes
            )));
        }

        for slot in 0..count {
            let offset = slot * frame_bytes;
            let frame = Frame::read_le(batches.dtype, &batches.shape, &mmap[offset..offset + frame_bytes])?;
            visit(batch * batches.batch_size + slot, frame)?;
        }
    }
    Ok(())
}

/// Convert every stored frame to its own archive `iter{i}` under `out_dir`.
///
/// Each archive holds the frame under the field `image`. Returns the number
/// of files written.
pub fn export_frames(batches: &FrameBatches, out_dir: &Path) -> AppResult<usize> {
    fs::create_dir_all(out_dir)?;
    let mut exported = 0;
    replay(batches, |index, frame| {
        let mut archive = ArrayArchive::new();
        archive.insert_frame("image", &frame)?;
        archive.write(&out_dir.join(format!("iter{index}.{EXTENSION}")))?;
        exported += 1;
        Ok(())
    })?;
    Ok(exported)
}
