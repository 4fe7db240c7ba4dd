//! In-memory voxel data.

use crate::errors::ImageError;
use serde::{Deserialize, Serialize};

/// Maximum number of dimensions a NIfTI-1 image can carry.
pub const MAX_DIMS: usize = 7;

/// A dense array of `f32` voxel values in column-major order.
///
/// The first index varies fastest, which is the on-disk NIfTI order, so
/// arrays can be written out without reshuffling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelArray {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl VoxelArray {
    /// Creates an array, checking that `values` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, ImageError> {
        if shape.is_empty() || shape.len() > MAX_DIMS {
            return Err(ImageError::ShapeMismatch {
                expected: vec![values.len()],
                actual: shape,
            });
        }
        let count: usize = shape.iter().product();
        if count != values.len() {
            return Err(ImageError::ShapeMismatch {
                expected: shape,
                actual: vec![values.len()],
            });
        }
        Ok(Self { shape, values })
    }

    /// Creates a zero-filled array.
    pub fn zeros(shape: Vec<usize>) -> Result<Self, ImageError> {
        Self::filled(shape, 0.0)
    }

    /// Creates an array with every voxel set to `value`.
    pub fn filled(shape: Vec<usize>, value: f32) -> Result<Self, ImageError> {
        let count = shape.iter().product();
        Self::new(shape, vec![value; count])
    }

    /// Extents in each dimension.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Voxel values, column-major.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Mutable voxel values.
    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    /// Consumes the array and returns its values.
    #[must_use]
    pub fn into_values(self) -> Vec<f32> {
        self.values
    }

    /// Number of voxels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the array holds no voxels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of volumes: the fourth extent, or 1 for 3D and lower.
    #[must_use]
    pub fn nvols(&self) -> usize {
        self.shape.get(3).copied().unwrap_or(1)
    }

    /// Value at a multi-dimensional index, or `None` when out of range.
    #[must_use]
    pub fn get(&self, index: &[usize]) -> Option<f32> {
        if index.len() != self.shape.len() {
            return None;
        }
        let mut offset = 0;
        let mut stride = 1;
        for (&i, &extent) in index.iter().zip(&self.shape) {
            if i >= extent {
                return None;
            }
            offset += i * stride;
            stride *= extent;
        }
        self.values.get(offset).copied()
    }
}

/// Spatial geometry of an image: voxel sizes and the voxel-to-world affine.
///
/// Derived images share the grid of their source so outputs stay aligned.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    /// Voxel sizes in mm.
    pub voxel_sizes: [f32; 3],
    /// First three rows of the 4x4 affine.
    pub affine: [[f32; 4]; 3],
}

impl Default for Grid {
    fn default() -> Self {
        Self {
            voxel_sizes: [1.0; 3],
            affine: [
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [0.0, 0.0, 1.0, 0.0],
            ],
        }
    }
}

impl Grid {
    /// A grid with the given voxel sizes and a scaling affine.
    #[must_use]
    pub fn with_voxel_sizes(voxel_sizes: [f32; 3]) -> Self {
        let mut grid = Self {
            voxel_sizes,
            ..Self::default()
        };
        for (axis, size) in voxel_sizes.iter().enumerate() {
            grid.affine[axis][axis] = *size;
        }
        grid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_count_mismatch() {
        let err = VoxelArray::new(vec![2, 2], vec![1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, ImageError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_new_rejects_too_many_dims() {
        assert!(VoxelArray::new(vec![1; 8], vec![0.0]).is_err());
        assert!(VoxelArray::new(vec![], vec![]).is_err());
    }

    #[test]
    fn test_column_major_indexing() {
        let arr = VoxelArray::new(vec![2, 3], vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        assert_eq!(arr.get(&[1, 0]), Some(1.0));
        assert_eq!(arr.get(&[0, 1]), Some(2.0));
        assert_eq!(arr.get(&[1, 2]), Some(5.0));
        assert_eq!(arr.get(&[2, 0]), None);
        assert_eq!(arr.get(&[0]), None);
    }

    #[test]
    fn test_nvols() {
        assert_eq!(VoxelArray::zeros(vec![2, 2, 2]).unwrap().nvols(), 1);
        assert_eq!(VoxelArray::zeros(vec![2, 2, 2, 8]).unwrap().nvols(), 8);
    }

    #[test]
    fn test_grid_with_voxel_sizes() {
        let grid = Grid::with_voxel_sizes([3.0, 3.0, 5.0]);
        assert_eq!(grid.affine[2][2], 5.0);
        assert_eq!(grid.affine[0][3], 0.0);
    }
}
