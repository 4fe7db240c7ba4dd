//! Pipeline lifecycle events.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event names emitted by a pipeline.
pub mod names {
    /// The pipeline started running.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// A step was dispatched.
    pub const STEP_STARTED: &str = "pipeline.step_started";
    /// A step finished, successfully or not.
    pub const STEP_COMPLETED: &str = "pipeline.step_completed";
    /// Overall progress changed.
    pub const PROGRESS: &str = "pipeline.progress";
    /// The pipeline reached a terminal state.
    pub const FINISHED: &str = "pipeline.finished";
}
