//! Mean-shift baseline correction for emission spectra.

use crate::hardware::capabilities::RawSpectrum;
use crate::hardware::readings::SpectralReading;

/// Pixels at the tail of the sensor used to estimate the dark baseline.
pub const BASELINE_TAIL: usize = 20;

/// Pixels at the head of the sensor excluded from the total intensity.
pub const INTENSITY_SKIP: usize = 20;

/// Subtract the tail baseline and integrate the corrected spectrum.
///
/// The baseline is the mean of `raw[len-20 .. len-1]` (the last pixel is
/// excluded). Spectra too short to have a tail window use a zero baseline.
/// Wavelengths are dropped unless `keep_wavelengths` is set.
pub fn correct(raw: RawSpectrum, keep_wavelengths: bool) -> SpectralReading {
    let len = raw.intensities.len();
    let tail = &raw.intensities[len.saturating_sub(BASELINE_TAIL)..len.saturating_sub(1)];
    let baseline_shift = if tail.is_empty() {
        0.0
    } else {
        tail.iter().sum::<f64>() / tail.len() as f64
    };

    let spectrum: Vec<f64> = raw.intensities.iter().map(|v| v - baseline_shift).collect();
    let total_intensity = spectrum.iter().skip(INTENSITY_SKIP).sum();

    SpectralReading {
        total_intensity,
        spectrum,
        wavelengths: if keep_wavelengths {
            raw.wavelengths
        } else {
            Vec::new()
        },
        baseline_shift,
    }
}
