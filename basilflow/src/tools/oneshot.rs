//! Wrappers that run in a throwaway temporary workspace.
//!
//! Each function creates a temporary workspace, runs the wrapper of the same
//! name and tears the workspace down. Returned images are detached: their
//! data is loaded into memory and they no longer refer to the deleted
//! directory. Relative path inputs resolve against the current directory.
//!
//! Outputs for path inputs are returned as [`ImageOutput::Image`] rather than
//! [`ImageOutput::Path`], since the path would point into the deleted
//! workspace. Image and array inputs keep their form.

use super::fabber::{self, FabberOutput, FabberSettings};
use super::fsl::{self, BetOptions, BetOutput, CommonArgs, FlirtOptions, FlirtOutput, McflirtOptions};
use super::options::FitOptions;
use crate::config::WorkspaceConfig;
use crate::errors::Result;
use crate::image::SandboxImage;
use crate::workspace::{ImageInput, ImageOutput, MatrixInput, Workspace};
use std::path::PathBuf;

fn absolute(input: impl Into<ImageInput>) -> Result<ImageInput> {
    Ok(match input.into() {
        ImageInput::Path(path) if path.is_relative() => ImageInput::Path(std::env::current_dir()?.join(path)),
        other => other,
    })
}

fn absolute_matrix(input: impl Into<MatrixInput>) -> Result<MatrixInput> {
    Ok(match input.into() {
        MatrixInput::Path(path) if path.is_relative() => MatrixInput::Path(std::env::current_dir()?.join(path)),
        other => other,
    })
}

/// Loads an output into memory so it outlives the workspace.
///
/// Paths become detached images.
fn detach(output: ImageOutput) -> Result<ImageOutput> {
    Ok(match output {
        ImageOutput::Path(path) => ImageOutput::Image(SandboxImage::open(&path)?.detach()?),
        ImageOutput::Image(image) => ImageOutput::Image(image.detach()?),
        ImageOutput::Array(data) => ImageOutput::Array(data),
    })
}

fn detach_opt(output: Option<ImageOutput>) -> Result<Option<ImageOutput>> {
    output.map(detach).transpose()
}

fn with_workspace<T>(config: &WorkspaceConfig, f: impl FnOnce(&Workspace) -> Result<T>) -> Result<T> {
    let ws = Workspace::temporary(config.clone())?;
    tracing::debug!(dir = %ws.dir().display(), "Created one-shot workspace");
    let result = f(&ws);
    ws.close()?;
    result
}

/// One-shot [`fsl::bet`].
///
/// Path inputs yield in-memory [`ImageOutput::Image`] outputs.
pub fn bet(config: &WorkspaceConfig, img: impl Into<ImageInput>, options: &BetOptions) -> Result<BetOutput> {
    let img = absolute(img)?;
    with_workspace(config, |ws| {
        let out = fsl::bet(ws, img, options)?;
        Ok(BetOutput {
            brain: detach_opt(out.brain)?,
            mask: detach_opt(out.mask)?,
        })
    })
}

/// One-shot [`fsl::fast`].
///
/// Path inputs yield in-memory [`ImageOutput::Image`] outputs.
pub fn fast(config: &WorkspaceConfig, img: impl Into<ImageInput>, common: &CommonArgs) -> Result<ImageOutput> {
    let img = absolute(img)?;
    with_workspace(config, |ws| detach(fsl::fast(ws, img, common)?))
}

/// One-shot [`fsl::flirt`].
///
/// Path inputs yield in-memory [`ImageOutput::Image`] outputs.
pub fn flirt(
    config: &WorkspaceConfig,
    img: impl Into<ImageInput>,
    reference: impl Into<ImageInput>,
    options: &FlirtOptions,
) -> Result<FlirtOutput> {
    let img = absolute(img)?;
    let reference = absolute(reference)?;
    with_workspace(config, |ws| {
        let out = fsl::flirt(ws, img, reference, options)?;
        Ok(FlirtOutput {
            image: detach(out.image)?,
            ..out
        })
    })
}

/// One-shot [`fsl::apply_xfm`].
///
/// Path inputs yield in-memory [`ImageOutput::Image`] outputs.
pub fn apply_xfm(
    config: &WorkspaceConfig,
    img: impl Into<ImageInput>,
    reference: impl Into<ImageInput>,
    xfm: impl Into<MatrixInput>,
    common: &CommonArgs,
) -> Result<ImageOutput> {
    let img = absolute(img)?;
    let reference = absolute(reference)?;
    let xfm = absolute_matrix(xfm)?;
    with_workspace(config, |ws| detach(fsl::apply_xfm(ws, img, reference, xfm, common)?))
}

/// One-shot [`fsl::mcflirt`].
///
/// Path inputs yield in-memory [`ImageOutput::Image`] outputs.
pub fn mcflirt(config: &WorkspaceConfig, img: impl Into<ImageInput>, options: &McflirtOptions) -> Result<ImageOutput> {
    let img = absolute(img)?;
    let mut options = options.clone();
    options.reference = options.reference.map(absolute).transpose()?;
    with_workspace(config, |ws| detach(fsl::mcflirt(ws, img, &options)?))
}

/// One-shot [`fsl::maths`].
///
/// Path inputs yield in-memory [`ImageOutput::Image`] outputs.
pub fn maths(
    config: &WorkspaceConfig,
    img: impl Into<ImageInput>,
    operations: &str,
    common: &CommonArgs,
) -> Result<ImageOutput> {
    let img = absolute(img)?;
    with_workspace(config, |ws| detach(fsl::maths(ws, img, operations, common)?))
}

/// One-shot [`fabber::fabber`].
///
/// Path inputs yield in-memory [`ImageOutput::Image`] outputs. The output
/// directory is deleted with the workspace, so
/// [`FabberOutput::output_dir`] is only informational here.
pub fn fabber(
    config: &WorkspaceConfig,
    model_group: &str,
    img: impl Into<ImageInput>,
    mask: impl Into<ImageInput>,
    options: &FitOptions,
    settings: FabberSettings,
) -> Result<FabberOutput> {
    let img = absolute(img)?;
    let mask = absolute(mask)?;
    with_workspace(config, |ws| {
        let out = fabber::fabber(ws, model_group, img, mask, options, settings)?;
        let mut images = std::collections::BTreeMap::new();
        for (name, image) in out.images {
            images.insert(name, detach(image)?);
        }
        Ok(FabberOutput {
            mvn: detach(out.mvn)?,
            images,
            text: out.text,
            output_dir: PathBuf::from(out.output_dir.file_name().unwrap_or_default()),
            log: out.log,
        })
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::image::{nifti, VoxelArray};
    use crate::testing::{fake_fabber, fake_program};

    fn data() -> VoxelArray {
        VoxelArray::new(vec![2, 1, 1], vec![3.0, 6.0]).unwrap()
    }

    #[test]
    fn test_oneshot_path_output_is_detached_image() {
        let bin = tempfile::tempdir().unwrap();
        fake_program(
            bin.path(),
            "fslmaths",
            "last=\"\"\nfor a in \"$@\"; do last=\"$a\"; done\ncp \"$1.nii.gz\" \"$last.nii.gz\"",
        )
        .unwrap();
        let src = tempfile::tempdir().unwrap();
        let input = src.path().join("struc.nii.gz");
        nifti::write(&input, &data(), None).unwrap();

        let config = WorkspaceConfig::new().with_search_path([bin.path()]);
        let out = maths(&config, src.path().join("struc"), "-abs", &CommonArgs::new()).unwrap();

        let image = out.into_image().unwrap();
        assert!(image.dir().is_none());
        assert!(image.is_loaded());
        assert_eq!(image.name(), "struc_maths");
        assert_eq!(image.to_array().unwrap(), data());
    }

    #[test]
    fn test_oneshot_fabber_detaches_results() {
        let bin = tempfile::tempdir().unwrap();
        fake_fabber(bin.path(), "asl").unwrap();

        let config = WorkspaceConfig::new().with_search_path([bin.path()]);
        let out = fabber(
            &config,
            "asl",
            SandboxImage::from_array("asl", data()),
            data(),
            &FitOptions::new(),
            FabberSettings::default(),
        )
        .unwrap();

        let mvn = out.mvn.into_image().unwrap();
        assert!(mvn.dir().is_none());
        assert_eq!(mvn.to_array().unwrap(), data());
        assert_eq!(out.output_dir, PathBuf::from("asl_fabber"));
    }
}
