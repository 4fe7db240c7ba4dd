//! Minimal single-file NIfTI-1 codec.
//!
//! Reading supports either byte order, the common integer and float voxel
//! types, intensity scaling and gzip compression. Writing always produces
//! little-endian `float32` with an sform, which every FSL tool accepts.

use super::array::{Grid, VoxelArray, MAX_DIMS};
use crate::errors::ImageError;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const HEADER_SIZE: usize = 348;
const DATA_OFFSET: usize = 352;
const MAGIC_SINGLE: &[u8; 4] = b"n+1\0";
const MAGIC_PAIR: &[u8; 4] = b"ni1\0";
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

const DT_UINT8: i16 = 2;
const DT_INT16: i16 = 4;
const DT_INT32: i16 = 8;
const DT_FLOAT32: i16 = 16;
const DT_FLOAT64: i16 = 64;
const DT_INT8: i16 = 256;
const DT_UINT16: i16 = 512;
const DT_UINT32: i16 = 768;

/// The header fields the workspace cares about.
#[derive(Debug, Clone, PartialEq)]
pub struct NiftiHeader {
    /// Extents of each used dimension.
    pub dims: Vec<usize>,
    /// NIfTI datatype code.
    pub datatype: i16,
    /// Bits per voxel.
    pub bitpix: i16,
    /// Voxel sizes, `pixdim[1..=7]`.
    pub pixdim: [f32; 7],
    /// Byte offset of the voxel data.
    pub vox_offset: usize,
    /// Intensity scaling slope (0 means unscaled).
    pub scl_slope: f32,
    /// Intensity scaling intercept.
    pub scl_inter: f32,
    /// sform code; the affine rows are meaningful when positive.
    pub sform_code: i16,
    /// sform affine rows.
    pub srow: [[f32; 4]; 3],
    /// Byte order of the file.
    pub little_endian: bool,
}

impl NiftiHeader {
    /// Number of voxels described by the header.
    #[must_use]
    pub fn voxel_count(&self) -> usize {
        self.dims.iter().fold(1_usize, |count, &extent| count.saturating_mul(extent))
    }

    /// Grid derived from the header.
    ///
    /// The sform is used when present, otherwise a scaling affine built from
    /// the voxel sizes.
    #[must_use]
    pub fn grid(&self) -> Grid {
        let mut sizes = [1.0_f32; 3];
        for (size, pix) in sizes.iter_mut().zip(&self.pixdim) {
            if *pix != 0.0 {
                *size = pix.abs();
            }
        }
        if self.sform_code > 0 {
            Grid {
                voxel_sizes: sizes,
                affine: self.srow,
            }
        } else {
            Grid::with_voxel_sizes(sizes)
        }
    }

    fn bytes_per_voxel(&self) -> Result<usize, ImageError> {
        match self.datatype {
            DT_UINT8 | DT_INT8 => Ok(1),
            DT_INT16 | DT_UINT16 => Ok(2),
            DT_INT32 | DT_UINT32 | DT_FLOAT32 => Ok(4),
            DT_FLOAT64 => Ok(8),
            other => Err(ImageError::UnsupportedDatatype(other)),
        }
    }
}

struct Fields<'a> {
    bytes: &'a [u8],
    little_endian: bool,
}

impl Fields<'_> {
    fn array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[offset..offset + N]);
        out
    }

    fn i16(&self, offset: usize) -> i16 {
        let raw = self.array::<2>(offset);
        if self.little_endian {
            i16::from_le_bytes(raw)
        } else {
            i16::from_be_bytes(raw)
        }
    }

    fn f32(&self, offset: usize) -> f32 {
        let raw = self.array::<4>(offset);
        if self.little_endian {
            f32::from_le_bytes(raw)
        } else {
            f32::from_be_bytes(raw)
        }
    }
}

fn not_an_image(path: &Path, reason: impl Into<String>) -> ImageError {
    ImageError::NotAnImage {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn open_reader(path: &Path) -> Result<Box<dyn Read>, ImageError> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < magic.len() {
        let n = file.read(&mut magic[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let file = File::open(path)?;
    if filled == 2 && magic == GZIP_MAGIC {
        Ok(Box::new(GzDecoder::new(BufReader::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn parse_header(path: &Path, bytes: &[u8]) -> Result<NiftiHeader, ImageError> {
    if bytes.len() < HEADER_SIZE {
        return Err(not_an_image(path, "file too short for a NIfTI header"));
    }

    let sizeof_hdr = [bytes[0], bytes[1], bytes[2], bytes[3]];
    let little_endian = if i32::from_le_bytes(sizeof_hdr) == HEADER_SIZE as i32 {
        true
    } else if i32::from_be_bytes(sizeof_hdr) == HEADER_SIZE as i32 {
        false
    } else {
        return Err(not_an_image(path, "bad sizeof_hdr"));
    };

    let magic = &bytes[344..348];
    if magic == MAGIC_PAIR {
        return Err(not_an_image(path, "header/image file pairs are not supported"));
    }
    if magic != MAGIC_SINGLE {
        return Err(not_an_image(path, "bad magic"));
    }

    let fields = Fields {
        bytes,
        little_endian,
    };

    let ndim = fields.i16(40);
    let ndim = usize::try_from(ndim)
        .ok()
        .filter(|n| (1..=MAX_DIMS).contains(n))
        .ok_or_else(|| not_an_image(path, format!("invalid dimension count {ndim}")))?;

    let mut dims = Vec::with_capacity(ndim);
    for i in 1..=ndim {
        let extent = fields.i16(40 + 2 * i);
        let extent = usize::try_from(extent)
            .ok()
            .filter(|e| *e > 0)
            .ok_or_else(|| not_an_image(path, format!("invalid extent {extent} in dimension {i}")))?;
        dims.push(extent);
    }

    let mut pixdim = [0.0_f32; 7];
    for (i, pix) in pixdim.iter_mut().enumerate() {
        *pix = fields.f32(80 + 4 * i);
    }

    let mut srow = [[0.0_f32; 4]; 3];
    for (r, row) in srow.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = fields.f32(280 + 16 * r + 4 * c);
        }
    }

    let vox_offset = fields.f32(108);
    let vox_offset = if vox_offset.is_finite() && vox_offset >= HEADER_SIZE as f32 {
        vox_offset as usize
    } else {
        DATA_OFFSET
    };

    Ok(NiftiHeader {
        dims,
        datatype: fields.i16(70),
        bitpix: fields.i16(72),
        pixdim,
        vox_offset,
        scl_slope: fields.f32(112),
        scl_inter: fields.f32(116),
        sform_code: fields.i16(254),
        srow,
        little_endian,
    })
}

/// Reads and validates the header of a NIfTI-1 file.
///
/// Anything that is not a single-file NIfTI-1 image yields
/// [`ImageError::NotAnImage`].
pub fn read_header(path: impl AsRef<Path>) -> Result<NiftiHeader, ImageError> {
    let path = path.as_ref();
    let mut reader = open_reader(path)?;
    let mut bytes = Vec::with_capacity(HEADER_SIZE);
    reader
        .by_ref()
        .take(HEADER_SIZE as u64)
        .read_to_end(&mut bytes)
        .map_err(|e| not_an_image(path, e.to_string()))?;
    parse_header(path, &bytes)
}

/// Reads a NIfTI-1 file into voxel data and its grid.
pub fn read(path: impl AsRef<Path>) -> Result<(VoxelArray, Grid), ImageError> {
    let path = path.as_ref();
    let mut bytes = Vec::new();
    open_reader(path)?
        .read_to_end(&mut bytes)
        .map_err(|e| not_an_image(path, e.to_string()))?;

    let header = parse_header(path, &bytes)?;
    let width = header.bytes_per_voxel()?;
    let end = header
        .dims
        .iter()
        .try_fold(width, |len, &extent| len.checked_mul(extent))
        .and_then(|len| header.vox_offset.checked_add(len))
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| not_an_image(path, "truncated voxel data"))?;

    let raw = &bytes[header.vox_offset..end];
    let mut values = decode_voxels(raw, header.datatype, header.little_endian)?;

    let slope = header.scl_slope;
    let inter = header.scl_inter;
    if slope != 0.0 && slope.is_finite() && !(slope == 1.0 && inter == 0.0) {
        for v in &mut values {
            *v = v.mul_add(slope, inter);
        }
    }

    let grid = header.grid();
    Ok((VoxelArray::new(header.dims, values)?, grid))
}

macro_rules! decode_as {
    ($raw:expr, $ty:ty, $le:expr) => {{
        const WIDTH: usize = std::mem::size_of::<$ty>();
        $raw.chunks_exact(WIDTH)
            .map(|chunk| {
                let mut buf = [0u8; WIDTH];
                buf.copy_from_slice(chunk);
                let value = if $le {
                    <$ty>::from_le_bytes(buf)
                } else {
                    <$ty>::from_be_bytes(buf)
                };
                value as f32
            })
            .collect::<Vec<f32>>()
    }};
}

fn decode_voxels(raw: &[u8], datatype: i16, le: bool) -> Result<Vec<f32>, ImageError> {
    let values = match datatype {
        DT_UINT8 => raw.iter().map(|&b| f32::from(b)).collect(),
        DT_INT8 => decode_as!(raw, i8, le),
        DT_INT16 => decode_as!(raw, i16, le),
        DT_UINT16 => decode_as!(raw, u16, le),
        DT_INT32 => decode_as!(raw, i32, le),
        DT_UINT32 => decode_as!(raw, u32, le),
        DT_FLOAT32 => decode_as!(raw, f32, le),
        DT_FLOAT64 => decode_as!(raw, f64, le),
        other => return Err(ImageError::UnsupportedDatatype(other)),
    };
    Ok(values)
}

/// Encodes voxel data as a little-endian `float32` NIfTI-1 image.
pub fn encode(data: &VoxelArray, grid: Option<&Grid>) -> Result<Vec<u8>, ImageError> {
    let grid = grid.copied().unwrap_or_default();
    let mut out = vec![0u8; DATA_OFFSET];

    let put_i16 = |out: &mut Vec<u8>, offset: usize, value: i16| {
        out[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    };
    let put_f32 = |out: &mut Vec<u8>, offset: usize, value: f32| {
        out[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    };

    out[0..4].copy_from_slice(&(HEADER_SIZE as i32).to_le_bytes());

    let shape = data.shape();
    let ndim = i16::try_from(shape.len()).map_err(|_| ImageError::ShapeMismatch {
        expected: vec![MAX_DIMS],
        actual: shape.to_vec(),
    })?;
    put_i16(&mut out, 40, ndim);
    for i in 1..=MAX_DIMS {
        let extent = match shape.get(i - 1) {
            Some(&extent) => i16::try_from(extent).map_err(|_| ImageError::ShapeMismatch {
                expected: vec![i16::MAX as usize],
                actual: shape.to_vec(),
            })?,
            None => 1,
        };
        put_i16(&mut out, 40 + 2 * i, extent);
    }

    put_i16(&mut out, 70, DT_FLOAT32);
    put_i16(&mut out, 72, 32);

    put_f32(&mut out, 76, 1.0);
    for i in 0..7 {
        let pix = grid.voxel_sizes.get(i).copied().unwrap_or(1.0);
        put_f32(&mut out, 80 + 4 * i, pix);
    }

    put_f32(&mut out, 108, DATA_OFFSET as f32);
    put_f32(&mut out, 112, 1.0);
    put_f32(&mut out, 116, 0.0);
    // mm and seconds
    out[123] = 10;
    put_i16(&mut out, 254, 1);
    for (r, row) in grid.affine.iter().enumerate() {
        for (c, value) in row.iter().enumerate() {
            put_f32(&mut out, 280 + 16 * r + 4 * c, *value);
        }
    }
    out[344..348].copy_from_slice(MAGIC_SINGLE);

    out.reserve(data.len() * 4);
    for value in data.values() {
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(out)
}

/// Writes voxel data to `path`, gzip-compressed when the name ends in `.gz`.
pub fn write(path: impl AsRef<Path>, data: &VoxelArray, grid: Option<&Grid>) -> Result<(), ImageError> {
    let path = path.as_ref();
    let bytes = encode(data, grid)?;
    let file = File::create(path)?;

    let compressed = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("gz"));
    if compressed {
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        encoder.write_all(&bytes)?;
        encoder.finish()?.flush()?;
    } else {
        let mut writer = BufWriter::new(file);
        writer.write_all(&bytes)?;
        writer.flush()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> VoxelArray {
        VoxelArray::new(vec![2, 2, 1, 3], (0..12).map(|v| v as f32 * 0.5).collect()).unwrap()
    }

    #[test]
    fn test_write_read_plain_and_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let grid = Grid::with_voxel_sizes([3.0, 3.0, 6.0]);

        for name in ["img.nii", "img.nii.gz"] {
            let path = dir.path().join(name);
            write(&path, &sample(), Some(&grid)).unwrap();

            let (data, read_grid) = read(&path).unwrap();
            assert_eq!(data, sample());
            assert_eq!(read_grid, grid);
        }

        let raw = std::fs::read(dir.path().join("img.nii.gz")).unwrap();
        assert_eq!(raw[..2], GZIP_MAGIC);
    }

    #[test]
    fn test_read_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hdr.nii");
        write(&path, &sample(), None).unwrap();

        let header = read_header(&path).unwrap();
        assert_eq!(header.dims, vec![2, 2, 1, 3]);
        assert_eq!(header.datatype, DT_FLOAT32);
        assert_eq!(header.vox_offset, DATA_OFFSET);
        assert!(header.little_endian);
    }

    #[test]
    fn test_text_file_is_not_an_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logfile");
        std::fs::write(&path, "Iteration 1 of 20\n").unwrap();

        let err = read_header(&path).unwrap_err();
        assert!(matches!(err, ImageError::NotAnImage { .. }));
    }

    #[test]
    fn test_big_endian_int16_with_scaling() {
        let mut bytes = vec![0u8; DATA_OFFSET];
        bytes[0..4].copy_from_slice(&348_i32.to_be_bytes());
        bytes[40..42].copy_from_slice(&3_i16.to_be_bytes());
        for (i, extent) in [2_i16, 1, 1].iter().enumerate() {
            bytes[42 + 2 * i..44 + 2 * i].copy_from_slice(&extent.to_be_bytes());
        }
        bytes[70..72].copy_from_slice(&DT_INT16.to_be_bytes());
        bytes[72..74].copy_from_slice(&16_i16.to_be_bytes());
        bytes[108..112].copy_from_slice(&352.0_f32.to_be_bytes());
        bytes[112..116].copy_from_slice(&2.0_f32.to_be_bytes());
        bytes[116..120].copy_from_slice(&1.0_f32.to_be_bytes());
        bytes[344..348].copy_from_slice(MAGIC_SINGLE);
        bytes.extend_from_slice(&(-3_i16).to_be_bytes());
        bytes.extend_from_slice(&10_i16.to_be_bytes());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("be.nii");
        std::fs::write(&path, &bytes).unwrap();

        let (data, grid) = read(&path).unwrap();
        assert_eq!(data.shape(), &[2, 1, 1]);
        assert_eq!(data.values(), &[-5.0, 21.0]);
        assert_eq!(grid, Grid::default());
    }

    #[test]
    fn test_huge_vox_offset_rejected() {
        let mut bytes = vec![0u8; DATA_OFFSET];
        bytes[0..4].copy_from_slice(&348_i32.to_le_bytes());
        bytes[40..42].copy_from_slice(&3_i16.to_le_bytes());
        for i in 0..3 {
            bytes[42 + 2 * i..44 + 2 * i].copy_from_slice(&1_i16.to_le_bytes());
        }
        bytes[70..72].copy_from_slice(&DT_FLOAT32.to_le_bytes());
        bytes[72..74].copy_from_slice(&32_i16.to_le_bytes());
        bytes[108..112].copy_from_slice(&1e30_f32.to_le_bytes());
        bytes[344..348].copy_from_slice(MAGIC_SINGLE);
        bytes.extend_from_slice(&1.0_f32.to_le_bytes());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.nii");
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(read(&path), Err(ImageError::NotAnImage { .. })));
    }

    #[test]
    fn test_huge_extents_rejected() {
        let mut bytes = vec![0u8; DATA_OFFSET];
        bytes[0..4].copy_from_slice(&348_i32.to_le_bytes());
        bytes[40..42].copy_from_slice(&7_i16.to_le_bytes());
        for i in 0..7 {
            bytes[42 + 2 * i..44 + 2 * i].copy_from_slice(&i16::MAX.to_le_bytes());
        }
        bytes[70..72].copy_from_slice(&DT_FLOAT32.to_le_bytes());
        bytes[72..74].copy_from_slice(&32_i16.to_le_bytes());
        bytes[108..112].copy_from_slice(&352.0_f32.to_le_bytes());
        bytes[344..348].copy_from_slice(MAGIC_SINGLE);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.nii");
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(read(&path), Err(ImageError::NotAnImage { .. })));
    }

    #[test]
    fn test_truncated_data_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.nii");
        let mut bytes = encode(&sample(), None).unwrap();
        bytes.truncate(DATA_OFFSET + 8);
        std::fs::write(&path, &bytes).unwrap();

        assert!(read_header(&path).is_ok());
        assert!(matches!(read(&path), Err(ImageError::NotAnImage { .. })));
    }
}
