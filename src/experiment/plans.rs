//! Input sequences for a run.
//!
//! A run is driven by two equally long sequences of power and flow
//! setpoints, one pair per tick. The builders here cover the three
//! experiment designs used on the jet: a constant treatment, a multistep
//! profile and a shuffled power×flow grid.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Power and flow setpoints, one pair per tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InputSequence {
    /// Power setpoints, W.
    pub power: Vec<f64>,
    /// Flow setpoints, slm.
    pub flow: Vec<f64>,
}

impl InputSequence {
    /// Number of ticks.
    pub fn len(&self) -> usize {
        self.power.len().min(self.flow.len())
    }

    /// True when there is nothing to run.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split into `(power, flow)`.
    pub fn into_parts(self) -> (Vec<f64>, Vec<f64>) {
        (self.power, self.flow)
    }
}

/// Parse an operator-supplied number of seconds.
pub fn seconds(what: &str, secs: f64) -> AppResult<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|e| {
        DaqError::Configuration(format!(
            "{what} must be a non-negative number of seconds, got {secs}: {e}"
        ))
    })
}

fn ticks_in(duration: Duration, period: Duration) -> AppResult<usize> {
    if period.is_zero() {
        return Err(DaqError::Configuration("sampling period must be positive".to_string()));
    }
    Ok((duration.as_secs_f64() / period.as_secs_f64()).floor() as usize)
}

/// Hold one setpoint pair for `duration`.
pub fn constant(power: f64, flow: f64, duration: Duration, period: Duration) -> AppResult<InputSequence> {
    let n = ticks_in(duration, period)?;
    if n == 0 {
        return Err(DaqError::Configuration(format!(
            "treatment of {:?} is shorter than one sampling period ({:?})",
            duration, period
        )));
    }
    Ok(InputSequence {
        power: vec![power; n],
        flow: vec![flow; n],
    })
}

/// Values from `start` up to (excluding) `stop` in steps of `step`.
pub fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    if step <= 0.0 || !step.is_finite() || stop <= start {
        return Vec::new();
    }
    let n = ((stop - start) / step).ceil() as usize;
    (0..n).map(|k| start + k as f64 * step).collect()
}

/// Hold each `(power, flow)` level for `step_length`.
pub fn multistep(levels: &[(f64, f64)], step_length: Duration, period: Duration) -> AppResult<InputSequence> {
    let repeat = ticks_in(step_length, period)?;
    if repeat == 0 {
        return Err(DaqError::Configuration(format!(
            "step length {:?} is shorter than one sampling period ({:?})",
            step_length, period
        )));
    }
    let mut seq = InputSequence::default();
    for &(p, q) in levels {
        seq.power.extend(std::iter::repeat(p).take(repeat));
        seq.flow.extend(std::iter::repeat(q).take(repeat));
    }
    Ok(seq)
}

/// Bounds of a power×flow grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    /// Lowest power, W.
    pub power_min: f64,
    /// Power upper bound (exclusive), W.
    pub power_max: f64,
    /// Lowest flow, slm.
    pub flow_min: f64,
    /// Flow upper bound (exclusive), slm.
    pub flow_max: f64,
    /// Grid spacing on both axes.
    pub step: f64,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            power_min: 1.5,
            power_max: 5.0,
            flow_min: 1.5,
            flow_max: 5.0,
            step: 0.25,
        }
    }
}

impl GridSpec {
    /// Midpoint of both ranges.
    pub fn nominal(&self) -> (f64, f64) {
        (
            (self.power_min + self.power_max) / 2.0,
            (self.flow_min + self.flow_max) / 2.0,
        )
    }
}

/// Levels of the grid in a seeded random order.
///
/// The list starts with an off level followed by three nominal levels so the
/// jet settles before the grid begins. Power and flow stay paired.
pub fn shuffled_grid(spec: &GridSpec, seed: u64) -> Vec<(f64, f64)> {
    let powers = arange(spec.power_min, spec.power_max, spec.step);
    let flows = arange(spec.flow_min, spec.flow_max, spec.step);
    let mut grid: Vec<(f64, f64)> = powers
        .iter()
        .flat_map(|&p| flows.iter().map(move |&q| (p, q)))
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    grid.shuffle(&mut rng);

    let nominal = spec.nominal();
    let mut levels = vec![(0.0, 0.0), nominal, nominal, nominal];
    levels.extend(grid);
    levels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_treatment_covers_the_duration() {
        let seq = constant(3.0, 2.0, Duration::from_secs(60), Duration::from_millis(500)).unwrap();
        assert_eq!(seq.len(), 120);
        assert!(seq.power.iter().all(|&p| p == 3.0));
        assert!(constant(3.0, 2.0, Duration::from_millis(100), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn seconds_rejects_negative_and_nan() {
        assert_eq!(seconds("duration", 1.5).unwrap(), Duration::from_millis(1500));
        assert!(matches!(seconds("duration", -1.0), Err(DaqError::Configuration(_))));
        assert!(matches!(seconds("step_length", f64::NAN), Err(DaqError::Configuration(_))));
        assert!(seconds("duration", f64::INFINITY).is_err());
    }

    #[test]
    fn arange_excludes_the_stop_value() {
        assert_eq!(arange(1.0, 2.0, 0.25), vec![1.0, 1.25, 1.5, 1.75]);
        assert!(arange(2.0, 1.0, 0.25).is_empty());
        assert!(arange(1.0, 2.0, 0.0).is_empty());
    }

    #[test]
    fn multistep_repeats_each_level() {
        let seq = multistep(&[(1.0, 2.0), (3.0, 4.0)], Duration::from_secs(3), Duration::from_secs(1)).unwrap();
        assert_eq!(seq.power, vec![1.0, 1.0, 1.0, 3.0, 3.0, 3.0]);
        assert_eq!(seq.flow, vec![2.0, 2.0, 2.0, 4.0, 4.0, 4.0]);
    }

    #[test]
    fn grid_is_prefixed_and_deterministic() {
        let spec = GridSpec {
            power_min: 1.0,
            power_max: 2.0,
            flow_min: 3.0,
            flow_max: 3.5,
            step: 0.25,
        };
        let levels = shuffled_grid(&spec, 0);
        assert_eq!(levels.len(), 4 + 4 * 2);
        assert_eq!(levels[0], (0.0, 0.0));
        assert_eq!(&levels[1..4], &[(1.5, 3.25); 3]);
        assert_eq!(levels, shuffled_grid(&spec, 0));

        let mut grid = levels[4..].to_vec();
        grid.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(grid[0], (1.0, 3.0));
        assert_eq!(grid[7], (1.75, 3.25));
    }
}
