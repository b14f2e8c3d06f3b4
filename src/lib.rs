//! # Plasma DAQ Core Library
//!
//! Deadline-bound acquisition and actuation loop for an atmospheric pressure
//! plasma jet. Every sampling period the loop reads the thermal camera,
//! spectrometer, oscilloscope and microcontroller telemetry concurrently,
//! stores raw frames in bounded batches and sends the next power/flow
//! setpoints before the period elapses.
//!
//! ## Crate Structure
//!
//! - **`config`**: Layered run settings (defaults, TOML, environment) and the
//!   immutable, validated `RunConfig`.
//! - **`error`**: The `DaqError` enum and the layered `DriverError`.
//! - **`hardware`**: Capability traits, reading types, the typed device
//!   registry, the serial telemetry link and simulated instruments.
//! - **`experiment`**: Concurrent sampler, deadline scheduler, aggregator,
//!   input sequences and the `RunEngine`.
//! - **`data`**: Frame batches, compressed archives and the persister.
//! - **`tracing_setup`**: Structured logging initialization.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod tracing_setup;
