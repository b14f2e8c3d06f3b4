//! Surface temperature analysis for radiometric frames.

use anyhow::{bail, Result};

use crate::hardware::readings::{Frame, FrameData, ThermalReading};

/// Pixel offsets of the two spatial temperature rings.
pub const SPATIAL_OFFSETS: (usize, usize) = (2, 12);

/// Convert a centi-Kelvin pixel to degrees Celsius.
pub fn ktoc(raw: u16) -> f64 {
    (f64::from(raw) - 27315.0) / 100.0
}

/// Analyse one frame.
///
/// Only the first plane of a multi-plane frame is analysed. The frame itself
/// is attached to the reading when `keep_frame` is set.
pub fn analyze(frame: Frame, spatial: bool, keep_frame: bool) -> Result<ThermalReading> {
    let FrameData::U16(pixels) = &frame.data else {
        bail!("thermal frames must carry u16 centi-Kelvin pixels");
    };
    let (rows, cols) = match frame.shape.as_slice() {
        [r, c] | [_, r, c] => (*r, *c),
        other => bail!("unsupported thermal frame shape {:?}", other),
    };
    if rows == 0 || cols == 0 || pixels.len() < rows * cols {
        bail!("thermal frame does not match its shape {:?}", frame.shape);
    }
    let plane = &pixels[..rows * cols];

    let (max_idx, max_raw) = plane
        .iter()
        .copied()
        .enumerate()
        .fold((0, plane[0]), |best, (i, v)| if v > best.1 { (i, v) } else { best });
    let (row, col) = (max_idx / cols, max_idx % cols);

    let spatial_temperatures = spatial.then(|| {
        (
            ring_average(plane, rows, cols, row, col, SPATIAL_OFFSETS.0),
            ring_average(plane, rows, cols, row, col, SPATIAL_OFFSETS.1),
        )
    });

    Ok(ThermalReading {
        max_temperature: ktoc(max_raw),
        spatial_temperatures,
        raw_frame: keep_frame.then_some(frame),
    })
}

/// Mean of the four cardinal neighbours `offset` pixels away.
/// A neighbour outside the frame is replaced by the centre pixel.
fn ring_average(
    plane: &[u16],
    rows: usize,
    cols: usize,
    row: usize,
    col: usize,
    offset: usize,
) -> f64 {
    let at = |r: usize, c: usize| ktoc(plane[r * cols + c]);
    let centre = at(row, col);

    let east = if col + offset < cols { at(row, col + offset) } else { centre };
    let west = if col >= offset { at(row, col - offset) } else { centre };
    let south = if row + offset < rows { at(row + offset, col) } else { centre };
    let north = if row >= offset { at(row - offset, col) } else { centre };

    (east + west + south + north) / 4.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(deg: f64) -> u16 {
        (deg * 100.0 + 27315.0).round() as u16
    }

    #[test]
    fn ktoc_converts_centi_kelvin() {
        assert_eq!(ktoc(27315), 0.0);
        assert!((ktoc(37315) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn max_and_rings_are_found_around_the_hottest_pixel() {
        let (rows, cols) = (30, 30);
        let mut px = vec![c(20.0); rows * cols];
        px[15 * cols + 15] = c(60.0);
        for (r, cc) in [(13, 15), (17, 15), (15, 13), (15, 17)] {
            px[r * cols + cc] = c(50.0);
        }
        px[3 * cols + 15] = c(30.0);
        px[27 * cols + 15] = c(30.0);

        let frame = Frame::from_u16(vec![rows, cols], px).unwrap();
        let reading = analyze(frame, true, false).unwrap();

        assert!((reading.max_temperature - 60.0).abs() < 1e-9);
        let (ts2, ts3) = reading.spatial_temperatures.unwrap();
        assert!((ts2 - 50.0).abs() < 1e-9);
        assert!((ts3 - 25.0).abs() < 1e-9);
        assert!(reading.raw_frame.is_none());
    }

    #[test]
    fn ring_falls_back_to_centre_at_the_edge() {
        let (rows, cols) = (5, 5);
        let mut px = vec![c(10.0); rows * cols];
        px[0] = c(40.0);

        let frame = Frame::from_u16(vec![rows, cols], px).unwrap();
        let reading = analyze(frame.clone(), true, true).unwrap();

        // north and west are out of bounds and use the centre value
        let (ts2, _) = reading.spatial_temperatures.unwrap();
        assert!((ts2 - 25.0).abs() < 1e-9);
        assert_eq!(reading.raw_frame, Some(frame));
    }

    #[test]
    fn rejects_u8_frames() {
        let frame = Frame::from_u8(vec![2, 2], vec![0; 4]).unwrap();
        assert!(analyze(frame, false, false).is_err());
    }
}
