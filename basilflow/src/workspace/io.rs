//! Normalizing tool inputs to files and outputs back to the caller's form.

use super::Workspace;
use crate::cancellation::CleanupGuard;
use crate::errors::{ImageError, Result};
use crate::image::{matrix_to_text, SandboxImage, VoxelArray};
use crate::utils::short_id;
use nalgebra::DMatrix;
use std::path::{Path, PathBuf};

/// An image argument to a tool wrapper.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageInput {
    /// A file name; relative names resolve against the workspace directory.
    Path(PathBuf),
    /// An image object, file-backed or in memory.
    Image(SandboxImage),
    /// Raw voxel data with no name or grid.
    Array(VoxelArray),
}

/// Which form an input took; outputs are returned in the same form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Path in, path out.
    Path,
    /// Image in, image out.
    Image,
    /// Array in, array out.
    Array,
}

impl ImageInput {
    /// The form of this input.
    #[must_use]
    pub fn kind(&self) -> InputKind {
        match self {
            Self::Path(_) => InputKind::Path,
            Self::Image(_) => InputKind::Image,
            Self::Array(_) => InputKind::Array,
        }
    }
}

impl From<&str> for ImageInput {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<String> for ImageInput {
    fn from(path: String) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for ImageInput {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<SandboxImage> for ImageInput {
    fn from(image: SandboxImage) -> Self {
        Self::Image(image)
    }
}

impl From<&SandboxImage> for ImageInput {
    fn from(image: &SandboxImage) -> Self {
        Self::Image(image.clone())
    }
}

impl From<VoxelArray> for ImageInput {
    fn from(data: VoxelArray) -> Self {
        Self::Array(data)
    }
}

/// A tool result in the form matching its primary input.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutput {
    /// Absolute path of the output file.
    Path(PathBuf),
    /// File-backed image object.
    Image(SandboxImage),
    /// Voxel data.
    Array(VoxelArray),
}

impl ImageOutput {
    /// The form of this output.
    #[must_use]
    pub fn kind(&self) -> InputKind {
        match self {
            Self::Path(_) => InputKind::Path,
            Self::Image(_) => InputKind::Image,
            Self::Array(_) => InputKind::Array,
        }
    }

    /// The path, if this is a path output.
    #[must_use]
    pub fn into_path(self) -> Option<PathBuf> {
        match self {
            Self::Path(path) => Some(path),
            _ => None,
        }
    }

    /// The image, if this is an image output.
    #[must_use]
    pub fn into_image(self) -> Option<SandboxImage> {
        match self {
            Self::Image(image) => Some(image),
            _ => None,
        }
    }

    /// The data, if this is an array output.
    #[must_use]
    pub fn into_array(self) -> Option<VoxelArray> {
        match self {
            Self::Array(data) => Some(data),
            _ => None,
        }
    }
}

/// An input written to disk for the duration of a tool call.
///
/// Raw arrays are saved to a scratch file that is deleted when this value is
/// dropped.
#[derive(Debug)]
pub struct MaterializedInput {
    image: SandboxImage,
    kind: InputKind,
    _cleanup: Option<CleanupGuard>,
}

impl MaterializedInput {
    /// The file-backed image.
    #[must_use]
    pub fn image(&self) -> &SandboxImage {
        &self.image
    }

    /// The caller's original input form.
    #[must_use]
    pub fn kind(&self) -> InputKind {
        self.kind
    }

    /// Logical name of the image.
    #[must_use]
    pub fn name(&self) -> &str {
        self.image.name()
    }

    /// Path to pass on a command line: directory and name, no extension.
    #[must_use]
    pub fn arg(&self) -> String {
        self.image
            .base_path()
            .map_or_else(|| self.image.name().to_string(), |p| p.display().to_string())
    }
}

/// A transform matrix argument.
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixInput {
    /// A matrix text file; relative names resolve against the workspace.
    Path(PathBuf),
    /// An in-memory matrix.
    Matrix(DMatrix<f64>),
}

impl From<&str> for MatrixInput {
    fn from(path: &str) -> Self {
        Self::Path(PathBuf::from(path))
    }
}

impl From<PathBuf> for MatrixInput {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<DMatrix<f64>> for MatrixInput {
    fn from(matrix: DMatrix<f64>) -> Self {
        Self::Matrix(matrix)
    }
}

/// A matrix written to disk for the duration of a tool call.
#[derive(Debug)]
pub struct MaterializedMatrix {
    path: PathBuf,
    _cleanup: Option<CleanupGuard>,
}

impl MaterializedMatrix {
    /// Path of the matrix file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Workspace {
    /// Makes an image input available as a file in or under the workspace.
    pub fn input_img(&self, input: impl Into<ImageInput>) -> Result<MaterializedInput> {
        let input = input.into();
        let kind = input.kind();
        let (image, cleanup) = match input {
            ImageInput::Path(path) => (
                SandboxImage::from_path_or(self.resolve_image_path(&path), self.output_ext()),
                None,
            ),
            ImageInput::Image(mut image) => {
                if image.dir().is_none() {
                    self.add_img(&mut image)?;
                }
                (image, None)
            }
            ImageInput::Array(data) => {
                let name = format!("fsl{}", short_id());
                let mut image = SandboxImage::from_array(name, data);
                let path = self.add_img(&mut image)?;
                (image, Some(CleanupGuard::remove_file(path)))
            }
        };
        Ok(MaterializedInput {
            image,
            kind,
            _cleanup: cleanup,
        })
    }

    /// Converts a result image to the caller's input form.
    pub fn output_img(&self, image: SandboxImage, kind: InputKind) -> Result<ImageOutput> {
        Ok(match kind {
            InputKind::Path => ImageOutput::Path(
                image
                    .file_path()
                    .ok_or_else(|| ImageError::NoData(image.name().to_string()))?,
            ),
            InputKind::Image => ImageOutput::Image(image),
            InputKind::Array => ImageOutput::Array(image.into_array()?),
        })
    }

    /// Makes a matrix input available as a text file.
    pub fn input_matrix(&self, input: impl Into<MatrixInput>) -> Result<MaterializedMatrix> {
        match input.into() {
            MatrixInput::Path(path) => Ok(MaterializedMatrix {
                path: self.resolve_image_path(&path),
                _cleanup: None,
            }),
            MatrixInput::Matrix(matrix) => {
                let name = format!("fsl{}.mat", short_id());
                let path = self.add_text(&matrix_to_text(&matrix), &name)?;
                Ok(MaterializedMatrix {
                    _cleanup: Some(CleanupGuard::remove_file(path.clone())),
                    path,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceConfig;
    use crate::image::text_to_matrix;

    fn data() -> VoxelArray {
        VoxelArray::new(vec![2, 1, 1], vec![4.0, 5.0]).unwrap()
    }

    #[test]
    fn test_array_input_is_temporary() {
        let ws = Workspace::temporary(WorkspaceConfig::new()).unwrap();
        let path = {
            let input = ws.input_img(data()).unwrap();
            assert_eq!(input.kind(), InputKind::Array);
            assert!(input.name().starts_with("fsl"));
            let path = input.image().file_path().unwrap();
            assert!(path.is_file());
            path
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_relative_path_resolves_in_workspace() {
        let ws = Workspace::temporary(WorkspaceConfig::new()).unwrap();
        crate::image::nifti::write(ws.dir().join("asl.nii"), &data(), None).unwrap();

        let input = ws.input_img("asl").unwrap();
        assert_eq!(input.kind(), InputKind::Path);
        assert_eq!(input.image().file_path().unwrap(), ws.dir().join("asl.nii"));
        assert_eq!(input.arg(), ws.dir().join("asl").display().to_string());
    }

    #[test]
    fn test_in_memory_image_saved_into_workspace() {
        let ws = Workspace::temporary(WorkspaceConfig::new()).unwrap();
        let input = ws.input_img(SandboxImage::from_array("calib", data())).unwrap();
        assert_eq!(input.kind(), InputKind::Image);
        assert!(ws.dir().join("calib.nii.gz").is_file());
    }

    #[test]
    fn test_output_matches_input_family() {
        let ws = Workspace::temporary(WorkspaceConfig::new()).unwrap();
        let image = SandboxImage::create(ws.dir().join("out.nii.gz"), data(), None).unwrap();

        let as_path = ws.output_img(image.clone(), InputKind::Path).unwrap();
        assert_eq!(as_path.clone().into_path(), Some(ws.dir().join("out.nii.gz")));
        assert!(as_path.into_array().is_none());

        let as_array = ws.output_img(image.clone(), InputKind::Array).unwrap();
        assert_eq!(as_array.into_array(), Some(data()));

        let as_image = ws.output_img(image, InputKind::Image).unwrap();
        assert_eq!(as_image.kind(), InputKind::Image);
    }

    #[test]
    fn test_matrix_input_written_as_text() {
        let ws = Workspace::temporary(WorkspaceConfig::new()).unwrap();
        let matrix = DMatrix::<f64>::identity(4, 4);

        let path = {
            let input = ws.input_matrix(matrix.clone()).unwrap();
            let text = std::fs::read_to_string(input.path()).unwrap();
            assert_eq!(text_to_matrix(&text).unwrap(), matrix);
            input.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
