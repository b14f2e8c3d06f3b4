//! Concurrent per-tick sampling.
//!
//! Each enabled instrument is sampled on its own tokio task. Tasks report on a
//! completion channel and the coordinator drains the channel until every
//! sender is gone, so a tick only finishes once every device has answered.
//! Readings are keyed by device kind, never by arrival order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::RunConfig;
use crate::hardware::{
    DeviceKind, DeviceReading, DeviceRegistry, EmbeddedReading, Frame, ScopeReading,
    SpectralReading, ThermalReading,
};

/// One reading per device kind for a single tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSet {
    readings: BTreeMap<DeviceKind, DeviceReading>,
    /// Wall-clock time of the fan-out.
    pub elapsed: Duration,
}

impl SampleSet {
    /// Build a set; kinds without a reading are marked unavailable.
    pub fn new(mut readings: BTreeMap<DeviceKind, DeviceReading>, elapsed: Duration) -> Self {
        for kind in DeviceKind::ALL {
            readings
                .entry(kind)
                .or_insert(DeviceReading::Unavailable(kind));
        }
        Self { readings, elapsed }
    }

    /// Reading for `kind`.
    pub fn get(&self, kind: DeviceKind) -> &DeviceReading {
        // `new` fills in every kind
        &self.readings[&kind]
    }

    /// Thermal reading, if available.
    pub fn thermal(&self) -> Option<&ThermalReading> {
        match self.get(DeviceKind::Thermal) {
            DeviceReading::Thermal(r) => Some(r),
            _ => None,
        }
    }

    /// Take the thermal reading's raw frame out of the set.
    pub fn take_frame(&mut self) -> Option<Frame> {
        match self.readings.get_mut(&DeviceKind::Thermal) {
            Some(DeviceReading::Thermal(r)) => r.raw_frame.take(),
            _ => None,
        }
    }

    /// Spectral reading, if available.
    pub fn spectral(&self) -> Option<&SpectralReading> {
        match self.get(DeviceKind::Spectral) {
            DeviceReading::Spectral(r) => Some(r),
            _ => None,
        }
    }

    /// Oscilloscope reading, if available.
    pub fn oscilloscope(&self) -> Option<&ScopeReading> {
        match self.get(DeviceKind::Oscilloscope) {
            DeviceReading::Oscilloscope(r) => Some(r),
            _ => None,
        }
    }

    /// Embedded telemetry, if available.
    pub fn embedded(&self) -> Option<&EmbeddedReading> {
        match self.get(DeviceKind::Embedded) {
            DeviceReading::Embedded(r) => Some(r),
            _ => None,
        }
    }

    /// Kinds that reported unavailable.
    pub fn unavailable(&self) -> Vec<DeviceKind> {
        self.readings
            .values()
            .filter(|r| !r.is_available())
            .map(DeviceReading::kind)
            .collect()
    }
}

/// Fans sampling out over every enabled device.
#[derive(Clone)]
pub struct ConcurrentSampler {
    registry: DeviceRegistry,
    config: Arc<RunConfig>,
}

impl ConcurrentSampler {
    /// Sampler over `registry` for the given run.
    pub fn new(registry: DeviceRegistry, config: Arc<RunConfig>) -> Self {
        Self { registry, config }
    }

    /// Sample every enabled device once and wait for all of them.
    pub async fn sample_tick(&self) -> SampleSet {
        let started = Instant::now();
        let (tx, mut rx) = mpsc::channel(DeviceKind::ALL.len());
        let mut handles = Vec::with_capacity(DeviceKind::ALL.len());

        for kind in DeviceKind::ALL {
            if !self.config.collects(kind) {
                continue;
            }
            let tx = tx.clone();
            let registry = self.registry.clone();
            let config = self.config.clone();
            handles.push((
                kind,
                tokio::spawn(async move {
                    let reading = registry.sample(kind, &config).await;
                    // the coordinator holds the receiver until every sender is dropped
                    let _ = tx.send(reading).await;
                }),
            ));
        }
        drop(tx);

        let mut readings = BTreeMap::new();
        while let Some(reading) = rx.recv().await {
            debug!(device = %reading.kind(), elapsed_ms = started.elapsed().as_millis() as u64, "Device sampled");
            readings.insert(reading.kind(), reading);
        }

        for (kind, handle) in handles {
            if let Err(e) = handle.await {
                error!(device = %kind, error = %e, "Sampling task aborted");
            }
        }

        SampleSet::new(readings, started.elapsed())
    }
}
