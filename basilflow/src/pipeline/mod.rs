//! Staged model-fitting pipelines.
//!
//! [`build_steps`] turns [`AnalysisOptions`] into an ordered list of
//! [`FitStep`]s. A [`BasilPipeline`] runs them one at a time through a
//! [`StepRunner`], passing each step's posterior to the next, and keeps a
//! [`PipelineState`] with status, progress and a cumulative log.

mod runner;
mod sequencer;
mod state;
mod steps;


pub use runner::{
    ProgressReporter, StepCompletion, StepRequest, StepRunner, WorkspaceStepRunner, CONTINUATION_ARTIFACT,
    OUTPUT_RENAMES,
};
pub use sequencer::{Advance, BasilPipeline, PipelineOutcome};
pub use state::PipelineState;
pub use steps::{build_steps, AnalysisOptions, FitStep};
