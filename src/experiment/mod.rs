//! Acquisition loop: concurrent sampling, deadline scheduling, aggregation
//! and the run engine that ties them together, plus the jet warm-up.

pub mod aggregator;
pub mod plans;
pub mod run_engine;
pub mod sampler;
pub mod scheduler;
pub mod warmup;

pub use aggregator::{Aggregator, RunRecord};
pub use plans::{GridSpec, InputSequence};
pub use run_engine::{RunEngine, RunOutcome};
pub use sampler::{ConcurrentSampler, SampleSet};
pub use scheduler::{DeadlineScheduler, Tick, TickOutcome};
pub use warmup::{warm_up, WarmupPlan};
