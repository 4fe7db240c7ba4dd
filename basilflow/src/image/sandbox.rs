//! File-backed images with lazy loading and extension inference.

use super::array::{Grid, VoxelArray};
use super::nifti;
use crate::errors::{BasilError, ConfigurationError, ImageError};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Extensions tried, in rank order, when a name is given without one.
pub const EXTENSION_CANDIDATES: [&str; 3] = ["", ".nii", ".nii.gz"];

const DEFAULT_EXTENSION: &str = ".nii.gz";

/// Splits a file name into its base name and NIfTI extension.
///
/// ```
/// use basilflow::image::split_image_name;
///
/// assert_eq!(split_image_name("asl.nii.gz"), ("asl".to_string(), ".nii.gz".to_string()));
/// assert_eq!(split_image_name("mask"), ("mask".to_string(), String::new()));
/// ```
#[must_use]
pub fn split_image_name(file_name: &str) -> (String, String) {
    for ext in [".nii.gz", ".nii"] {
        if let Some(base) = file_name.strip_suffix(ext) {
            if !base.is_empty() {
                return (base.to_string(), ext.to_string());
            }
        }
    }
    (file_name.to_string(), String::new())
}

fn with_suffix(base: &Path, ext: &str) -> PathBuf {
    let mut joined = OsString::from(base.as_os_str());
    joined.push(ext);
    PathBuf::from(joined)
}

/// Picks the first candidate extension for which a file exists at `base`.
fn infer_extension(base: &Path, default_ext: &str) -> String {
    EXTENSION_CANDIDATES
        .iter()
        .find(|ext| with_suffix(base, ext).is_file())
        .map_or_else(|| default_ext.to_string(), |ext| (*ext).to_string())
}

/// A named image that lives in a directory, in memory, or both.
///
/// Images created from a path load their voxels on first access. Images
/// created from an array have no directory until they are saved.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxImage {
    name: String,
    dir: Option<PathBuf>,
    ext: String,
    role: String,
    data: Option<VoxelArray>,
    grid: Option<Grid>,
}

impl SandboxImage {
    /// References an image on disk without reading it.
    ///
    /// A path without a NIfTI extension is completed with the first existing
    /// candidate, or `.nii.gz` when none exists.
    #[must_use]
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self::from_path_or(path, DEFAULT_EXTENSION)
    }

    /// Like [`SandboxImage::from_path`] with an explicit fallback extension.
    #[must_use]
    pub fn from_path_or(path: impl AsRef<Path>, default_ext: &str) -> Self {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let (name, mut ext) = split_image_name(&file_name);
        if ext.is_empty() {
            ext = infer_extension(&dir.join(&name), default_ext);
        }

        Self {
            role: name.clone(),
            name,
            dir: Some(dir),
            ext,
            data: None,
            grid: None,
        }
    }

    /// References an image on disk after checking that it has a valid header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let mut image = Self::from_path(path);
        let file = image.require_file()?;
        let header = nifti::read_header(&file)?;
        image.grid = Some(header.grid());
        Ok(image)
    }

    /// Wraps in-memory voxel data under a logical name.
    #[must_use]
    pub fn from_array(name: impl Into<String>, data: VoxelArray) -> Self {
        let (name, ext) = split_image_name(&name.into());
        Self {
            role: name.clone(),
            name,
            dir: None,
            ext,
            data: Some(data),
            grid: None,
        }
    }

    /// Writes voxel data to `path` and returns the saved image.
    pub fn create(path: impl AsRef<Path>, data: VoxelArray, grid: Option<Grid>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let file_name = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);

        let mut image = Self::from_array(file_name, data);
        image.grid = grid;
        image.save(&dir, DEFAULT_EXTENSION)?;
        Ok(image)
    }

    /// Logical name, without directory or extension.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptive role, e.g. "Mask" or "T1 map".
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Sets the role.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Directory holding the file, if the image is file-backed.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// On-disk extension, empty until known.
    #[must_use]
    pub fn ext(&self) -> &str {
        &self.ext
    }

    /// Spatial grid, when known.
    #[must_use]
    pub fn grid(&self) -> Option<&Grid> {
        self.grid.as_ref()
    }

    /// File name including extension.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, self.ext)
    }

    /// Directory joined with the logical name, without extension.
    #[must_use]
    pub fn base_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(&self.name))
    }

    /// Full path of the backing file.
    #[must_use]
    pub fn file_path(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(self.file_name()))
    }

    /// True if the voxel data is held in memory.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    fn require_file(&self) -> Result<PathBuf, ImageError> {
        self.file_path().ok_or_else(|| ImageError::NoData(self.name.clone()))
    }

    /// Voxel data, loaded from disk on first access.
    pub fn data(&mut self) -> Result<&VoxelArray, ImageError> {
        if self.data.is_none() {
            let (data, grid) = nifti::read(self.require_file()?)?;
            self.data = Some(data);
            self.grid.get_or_insert(grid);
        }
        self.data.as_ref().ok_or_else(|| ImageError::NoData(self.name.clone()))
    }

    /// Copy of the voxel data, reading the file if it is not loaded.
    pub fn to_array(&self) -> Result<VoxelArray, ImageError> {
        match self.data {
            Some(ref data) => Ok(data.clone()),
            None => Ok(nifti::read(self.require_file()?)?.0),
        }
    }

    /// Consumes the image and returns its voxel data.
    pub fn into_array(mut self) -> Result<VoxelArray, ImageError> {
        self.data()?;
        self.data.ok_or(ImageError::NoData(self.name))
    }

    /// Extents of the image, from memory or from the file header.
    pub fn shape(&self) -> Result<Vec<usize>, ImageError> {
        match self.data {
            Some(ref data) => Ok(data.shape().to_vec()),
            None => Ok(nifti::read_header(self.require_file()?)?.dims),
        }
    }

    /// Saves the voxel data into `dir`.
    ///
    /// The current extension is kept if one is known, otherwise `default_ext`
    /// is used. The image then refers to the written file.
    pub fn save(&mut self, dir: impl AsRef<Path>, default_ext: &str) -> Result<PathBuf, ImageError> {
        self.data()?;
        if self.grid.is_none() {
            self.grid = Some(Grid::default());
        }
        if self.ext.is_empty() {
            self.ext = default_ext.to_string();
        }

        let path = dir.as_ref().join(self.file_name());
        if let Some(ref data) = self.data {
            nifti::write(&path, data, self.grid.as_ref())?;
        }
        self.dir = Some(dir.as_ref().to_path_buf());
        Ok(path)
    }

    /// Human-readable role, name and full path.
    #[must_use]
    pub fn summary(&self) -> String {
        let path = self
            .file_path()
            .map_or_else(|| "(in memory)".to_string(), |p| p.display().to_string());
        format!(
            "{:<30}: {}\n{:<30}: {}\n",
            self.role, self.name, "Full path", path
        )
    }

    /// Checks that the image has exactly `shape`.
    pub fn check_shape(&self, shape: &[usize]) -> Result<(), BasilError> {
        let actual = self.shape()?;
        if actual.len() != shape.len() {
            return Err(ConfigurationError::new(format!(
                "{}: expected {} dims, got {}",
                self.role,
                shape.len(),
                actual.len()
            ))
            .into());
        }
        if actual != shape {
            return Err(ConfigurationError::new(format!(
                "{}: shape ({actual:?}) does not match ({shape:?})",
                self.role
            ))
            .into());
        }
        Ok(())
    }

    /// Creates an in-memory image on the same grid with new data.
    ///
    /// The new name is `name` if given, else this name plus `suffix`, else
    /// this name.
    pub fn derived(&self, data: VoxelArray, name: Option<&str>, suffix: Option<&str>) -> Result<Self, ImageError> {
        let name = match (name, suffix) {
            (Some(name), _) => name.to_string(),
            (None, Some(suffix)) => format!("{}{suffix}", self.name),
            (None, None) => self.name.clone(),
        };

        let grid = match self.grid {
            Some(grid) => Some(grid),
            None => match self.file_path() {
                Some(path) => Some(nifti::read_header(path)?.grid()),
                None => None,
            },
        };

        let mut derived = Self::from_array(name, data).with_role(self.role.clone());
        derived.grid = grid;
        Ok(derived)
    }

    /// Loads the data and forgets the directory.
    pub fn detach(mut self) -> Result<Self, ImageError> {
        self.data()?;
        self.dir = None;
        Ok(self)
    }
}
