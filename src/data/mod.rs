//! Data persistence: memory-mapped frame batches, compressed array archives
//! and the end-of-run persister.

pub mod archive;
pub mod frame_store;
pub mod storage;

pub use archive::ArrayArchive;
pub use frame_store::{FrameBatches, FrameStore};
pub use storage::{Artifact, ArtifactOutcome, PersistReport, Persister};
