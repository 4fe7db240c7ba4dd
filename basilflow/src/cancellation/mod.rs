//! Cooperative cancellation and scoped cleanup.
//!
//! This module provides:
//! - `CancellationToken`, shared between a pipeline and the external program
//!   currently running on its behalf
//! - `CleanupGuard`, which runs a closure when dropped so temporary files are
//!   removed on every exit path

mod cleanup;
mod token;

pub use cleanup::CleanupGuard;
pub use token::CancellationToken;
