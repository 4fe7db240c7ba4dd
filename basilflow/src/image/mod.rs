//! Image data, the NIfTI-1 codec and the matrix text format.
//!
//! Images handed to external programs are always files; [`SandboxImage`]
//! keeps track of where a dataset lives and loads or saves its voxel data
//! on demand.

mod array;
pub mod matrix;
pub mod nifti;
mod sandbox;

pub use array::{Grid, VoxelArray};
pub use matrix::{matrix_to_text, text_to_matrix};
pub use sandbox::{split_image_name, SandboxImage, EXTENSION_CANDIDATES};
