//! Core domain model types for basilflow.

mod status;

pub use status::PipelineStatus;
