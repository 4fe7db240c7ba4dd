//! Wrappers for the external imaging tools.
//!
//! Wrappers take a [`Workspace`](crate::workspace::Workspace) to run in; the
//! [`oneshot`] module has variants that create and discard their own.

mod fabber;
mod fsl;
pub mod oneshot;
mod options;

pub use fabber::{fabber, FabberOutput, FabberSettings, MVN_NAME};
pub use fsl::{
    apply_xfm, bet, fast, flirt, imcp, maths, mcflirt, BetOptions, BetOutput, CommonArgs, FlirtOptions,
    FlirtOutput, McflirtOptions,
};
pub use options::{keys, FitOptions, OptionValue};
