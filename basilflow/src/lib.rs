//! # Basilflow
//!
//! Chained model-fitting pipelines for arterial spin labelling (ASL) data,
//! driven through external command-line tools in a sandboxed workspace.
//!
//! Basilflow provides:
//!
//! - **Sandboxed images**: file-backed or in-memory voxel data with lazy
//!   loading, extension inference and a minimal NIfTI-1 codec
//! - **Execution workspaces**: a private directory in which external programs
//!   run, with outputs recovered by diffing the directory before and after
//! - **Tool wrappers**: typed argument builders for registration,
//!   segmentation, skull stripping, motion correction, arithmetic and
//!   model fitting
//! - **Step sequencing**: staged inference over several dependent model-fit
//!   invocations, with progress, cancellation and a cumulative log
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use basilflow::prelude::*;
//!
//! let store = Arc::new(InMemoryImageStore::new());
//! let workspace = Arc::new(Workspace::temporary(WorkspaceConfig::from_env())?);
//! let runner = Arc::new(WorkspaceStepRunner::new(workspace, store.clone()));
//!
//! let pipeline = BasilPipeline::build(&asl, &mask, &AnalysisOptions::default(), store, runner)?;
//! let outcome = pipeline.run().await;
//! println!("{}", outcome.log);
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod asl;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod image;
pub mod observability;
pub mod pipeline;
pub mod store;
pub mod testing;
pub mod tools;
pub mod utils;
pub mod workspace;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::asl::{AslImage, AslParameters, AslStructure, LabelScheme};
    pub use crate::cancellation::{CancellationToken, CleanupGuard};
    pub use crate::config::{OutputType, WorkspaceConfig};
    pub use crate::core::PipelineStatus;
    pub use crate::errors::{BasilError, ConfigurationError, ImageError, MatrixParseError, Result};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::image::{matrix_to_text, text_to_matrix, Grid, SandboxImage, VoxelArray};
    pub use crate::pipeline::{
        build_steps, AnalysisOptions, BasilPipeline, FitStep, PipelineOutcome, ProgressReporter,
        StepCompletion, StepRequest, StepRunner, WorkspaceStepRunner, CONTINUATION_ARTIFACT,
    };
    pub use crate::store::{ImageStore, InMemoryImageStore};
    pub use crate::tools::{FitOptions, OptionValue};
    pub use crate::workspace::{
        BufferLogSink, CommandArgs, ImageInput, ImageOutput, Invocation, LogSink, RunOutput,
        TracingLogSink, Workspace,
    };
    pub use std::sync::Arc;
}
