//! Device Capability Facade
//!
//! Capability traits for the jet instruments, the reading types they produce,
//! per-instrument analysis, the serial telemetry link and a typed registry that
//! samples any kind uniformly.

pub mod capabilities;
pub mod mock;
pub mod readings;
pub mod registry;
pub mod spectral;
pub mod telemetry;
pub mod thermal;

pub use readings::{
    DeviceKind, DeviceReading, EmbeddedReading, Frame, FrameData, PixelType, RequiredDevice,
    ScopeReading, SpectralReading, ThermalReading,
};
pub use registry::DeviceRegistry;
