//! Compressed named-array archives.
//!
//! Spectra, oscilloscope traces and exported frames are stored as a map of
//! named, shaped arrays. On disk an archive is:
//!
//! ```text
//! "PDAQARC1" | lz4 block (u32 LE uncompressed size prepended) of bincode(map)
//! ```
//!
//! LZ4 was chosen for speed: spectra matrices of a long run are rewritten on
//! every resave and the per-frame export writes thousands of small files.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};
use crate::hardware::{Frame, FrameData};

/// File signature.
pub const MAGIC: &[u8; 8] = b"PDAQARC1";

/// File extension used for archives.
pub const EXTENSION: &str = "pdarc";

/// Typed array payload.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrayData {
    F64(Vec<f64>),
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl ArrayData {
    fn len(&self) -> usize {
        match self {
            ArrayData::F64(v) => v.len(),
            ArrayData::U8(v) => v.len(),
            ArrayData::U16(v) => v.len(),
        }
    }
}

/// Array with its row-major shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedArray {
    /// Dimensions, outermost first.
    pub shape: Vec<usize>,
    /// Values in row-major order.
    pub data: ArrayData,
}

impl NamedArray {
    /// `f64` values, if that is the element type.
    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            ArrayData::F64(v) => Some(v),
            _ => None,
        }
    }

    /// Row `r` of a 2D `f64` array.
    pub fn row(&self, r: usize) -> Option<&[f64]> {
        let values = self.as_f64()?;
        let &[rows, cols] = self.shape.as_slice() else {
            return None;
        };
        (r < rows).then(|| &values[r * cols..(r + 1) * cols])
    }
}

/// Ordered collection of named arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArrayArchive {
    arrays: BTreeMap<String, NamedArray>,
}

impl ArrayArchive {
    /// Empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an array, checking its length against `shape`.
    pub fn insert(&mut self, name: impl Into<String>, shape: Vec<usize>, data: ArrayData) -> AppResult<()> {
        let name = name.into();
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(DaqError::Archive(format!(
                "array '{}' has {} values for shape {:?}",
                name,
                data.len(),
                shape
            )));
        }
        self.arrays.insert(name, NamedArray { shape, data });
        Ok(())
    }

    /// Insert a 1D `f64` vector.
    pub fn insert_vector(&mut self, name: impl Into<String>, values: Vec<f64>) -> AppResult<()> {
        let shape = vec![values.len()];
        self.insert(name, shape, ArrayData::F64(values))
    }

    /// Insert a 2D `f64` matrix given as rows of equal length.
    pub fn insert_matrix(&mut self, name: impl Into<String>, rows: &[Vec<f64>]) -> AppResult<()> {
        let name = name.into();
        let cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != cols) {
            return Err(DaqError::Archive(format!("matrix '{}' has ragged rows", name)));
        }
        let data = rows.iter().flatten().copied().collect();
        self.insert(name, vec![rows.len(), cols], ArrayData::F64(data))
    }

    /// Insert an image frame with its own shape and element type.
    pub fn insert_frame(&mut self, name: impl Into<String>, frame: &Frame) -> AppResult<()> {
        let data = match &frame.data {
            FrameData::U8(v) => ArrayData::U8(v.clone()),
            FrameData::U16(v) => ArrayData::U16(v.clone()),
        };
        self.insert(name, frame.shape.clone(), data)
    }

    /// Array by name.
    pub fn get(&self, name: &str) -> Option<&NamedArray> {
        self.arrays.get(name)
    }

    /// Array names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.arrays.keys().map(String::as_str).collect()
    }

    /// Number of arrays.
    pub fn len(&self) -> usize {
        self.arrays.len()
    }

    /// True when the archive holds no arrays.
    pub fn is_empty(&self) -> bool {
        self.arrays.is_empty()
    }

    /// Encode to the on-disk byte layout.
    pub fn to_bytes(&self) -> AppResult<Vec<u8>> {
        let payload = bincode::serialize(&self.arrays)
            .map_err(|e| DaqError::Archive(format!("encoding failed: {e}")))?;
        let mut out = Vec::with_capacity(MAGIC.len() + payload.len() / 2);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&lz4_flex::compress_prepend_size(&payload));
        Ok(out)
    }

    /// Decode from the on-disk byte layout.
    pub fn from_bytes(bytes: &[u8]) -> AppResult<Self> {
        let body = bytes
            .strip_prefix(MAGIC.as_slice())
            .ok_or_else(|| DaqError::Archive("missing archive signature".to_string()))?;
        let payload = lz4_flex::decompress_size_prepended(body)
            .map_err(|e| DaqError::Archive(format!("LZ4 decompression failed: {e}")))?;
        let arrays = bincode::deserialize(&payload)
            .map_err(|e| DaqError::Archive(format!("decoding failed: {e}")))?;
        Ok(Self { arrays })
    }

    /// Write the archive to `path`.
    pub fn write(&self, path: &Path) -> AppResult<()> {
        fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// Read an archive from `path`.
    pub fn read(path: &Path) -> AppResult<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_survives_disk_and_keeps_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("spectra.{EXTENSION}"));

        let mut archive = ArrayArchive::new();
        archive.insert_vector("wavelengths", vec![400.0, 500.0, 600.0]).unwrap();
        archive
            .insert_matrix("intensities", &[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]])
            .unwrap();
        let frame = Frame::from_u16(vec![2, 2], vec![1, 2, 3, 4]).unwrap();
        archive.insert_frame("image", &frame).unwrap();
        archive.write(&path).unwrap();

        let back = ArrayArchive::read(&path).unwrap();
        assert_eq!(back, archive);
        assert_eq!(back.names(), vec!["image", "intensities", "wavelengths"]);
        let intensities = back.get("intensities").unwrap();
        assert_eq!(intensities.shape, vec![2, 3]);
        assert_eq!(intensities.row(1).unwrap(), &[4.0, 5.0, 6.0]);
        assert_eq!(back.get("image").unwrap().data, ArrayData::U16(vec![1, 2, 3, 4]));
    }

    #[test]
    fn ragged_matrix_and_shape_mismatch_are_rejected() {
        let mut archive = ArrayArchive::new();
        assert!(archive.insert_matrix("m", &[vec![1.0], vec![1.0, 2.0]]).is_err());
        assert!(archive
            .insert("v", vec![2, 2], ArrayData::F64(vec![0.0; 3]))
            .is_err());
        assert!(archive.is_empty());
    }

    #[test]
    fn foreign_bytes_are_not_an_archive() {
        assert!(ArrayArchive::from_bytes(b"PK\x03\x04 not ours").is_err());
    }
}
