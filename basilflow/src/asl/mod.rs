//! ASL acquisition structure.
//!
//! An [`AslImage`] pairs a differenced ASL dataset with a validated
//! [`AslStructure`] describing its delays, label durations, labelling scheme,
//! repeats and volume ordering.

mod data;
mod structure;

pub use data::{structure_key, AslImage, STRUCTURE_KEY_PREFIX};
pub use structure::{AslParameters, AslStructure, LabelScheme};
