//! Testing utilities for basilflow pipelines.
//!
//! This module provides:
//! - A scripted [`StepRunner`](crate::pipeline::StepRunner) for driving
//!   pipelines without external programs
//! - Shell-script stand-ins for external programs (unix only)

mod mocks;
#[cfg(unix)]
mod programs;

pub use mocks::{ScriptedStep, ScriptedStepRunner};
#[cfg(unix)]
pub use programs::{fake_fabber, fake_program};
