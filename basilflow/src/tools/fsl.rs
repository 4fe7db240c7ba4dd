//! Wrappers for FSL command-line tools.
//!
//! Every wrapper derives its output name from the input name plus a task
//! suffix unless `output_name` is given, declares that name as the expected
//! output and returns results in the same form as the primary input.

use crate::errors::{BasilError, ConfigurationError, Result};
use crate::image::{matrix_to_text, text_to_matrix, SandboxImage};
use crate::workspace::{
    CommandArgs, ImageInput, ImageOutput, MaterializedInput, MatrixInput, RunOutput, Workspace,
};
use nalgebra::DMatrix;
use std::path::Path;

/// Options shared by all wrappers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommonArgs {
    /// Output name; defaults to the input name plus the task suffix.
    pub output_name: Option<String>,
    /// Extra arguments appended to the command line.
    pub args: CommandArgs,
}

impl CommonArgs {
    /// Creates empty common arguments.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the output name.
    #[must_use]
    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    /// Sets extra arguments.
    #[must_use]
    pub fn with_args(mut self, args: impl Into<CommandArgs>) -> Self {
        self.args = args.into();
        self
    }

    fn output_for(&self, input: &MaterializedInput, suffix: &str) -> String {
        self.output_name
            .clone()
            .unwrap_or_else(|| format!("{}{suffix}", input.name()))
    }
}

fn expected(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| regex::escape(n)).collect()
}

fn base_name(output: &str) -> &str {
    Path::new(output)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(output)
}

fn take_output(ws: &Workspace, run: &mut RunOutput, output: &str) -> Result<SandboxImage> {
    run.take_image(base_name(output))
        .ok_or_else(|| BasilError::output_recovery(ws.dir().join(output), "expected output image was not produced"))
}

fn run_tool(ws: &Workspace, program: &str, argv: Vec<String>, outputs: &[&str]) -> Result<RunOutput> {
    let patterns = expected(outputs);
    ws.execute(
        crate::workspace::Invocation::new(program)
            .args(argv)
            .expected(patterns),
    )
}

/// Options for [`bet`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BetOptions {
    /// Also write a binary brain mask (`_mask`).
    pub mask: bool,
    /// Write the brain-extracted image.
    pub brain: bool,
    /// Output name and extra arguments.
    pub common: CommonArgs,
}

impl Default for BetOptions {
    fn default() -> Self {
        Self {
            mask: false,
            brain: true,
            common: CommonArgs::default(),
        }
    }
}

/// Results of [`bet`].
#[derive(Debug, Clone, PartialEq)]
pub struct BetOutput {
    /// Brain-extracted image, unless disabled.
    pub brain: Option<ImageOutput>,
    /// Brain mask, if requested.
    pub mask: Option<ImageOutput>,
}

/// Brain extraction.
pub fn bet(ws: &Workspace, img: impl Into<ImageInput>, options: &BetOptions) -> Result<BetOutput> {
    let img = ws.input_img(img)?;
    let output = options.common.output_for(&img, "_bet");
    let mask_name = format!("{output}_mask");

    let mut argv = vec![img.arg(), output.clone()];
    argv.extend(options.common.args.to_argv()?);
    if options.mask {
        argv.push("-m".to_string());
    }
    if !options.brain {
        argv.push("-n".to_string());
    }

    let mut run = run_tool(ws, "bet", argv, &[output.as_str(), mask_name.as_str()])?;
    let brain = if options.brain {
        Some(ws.output_img(take_output(ws, &mut run, &output)?, img.kind())?)
    } else {
        None
    };
    let mask = if options.mask {
        Some(ws.output_img(take_output(ws, &mut run, &mask_name)?, img.kind())?)
    } else {
        None
    };
    Ok(BetOutput { brain, mask })
}

/// Tissue segmentation; returns the hard segmentation (`_seg`).
pub fn fast(ws: &Workspace, img: impl Into<ImageInput>, common: &CommonArgs) -> Result<ImageOutput> {
    let img = ws.input_img(img)?;
    let output = common.output_for(&img, "_fast");
    let seg = format!("{output}_seg");

    let mut argv = vec!["-o".to_string(), output];
    argv.extend(common.args.to_argv()?);
    argv.push(img.arg());

    let mut run = run_tool(ws, "fast", argv, &[seg.as_str()])?;
    ws.output_img(take_output(ws, &mut run, &seg)?, img.kind())
}

/// Options for [`flirt`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlirtOptions {
    /// Name of the matrix file to write.
    pub output_mat: Option<String>,
    /// Name of the inverse matrix file to write.
    pub output_invmat: Option<String>,
    /// Output name and extra arguments.
    pub common: CommonArgs,
}

/// Results of [`flirt`].
#[derive(Debug, Clone, PartialEq)]
pub struct FlirtOutput {
    /// Registered image.
    pub image: ImageOutput,
    /// Transformation matrix, if requested.
    pub matrix: Option<DMatrix<f64>>,
    /// Inverse transformation matrix, if requested.
    pub inverse: Option<DMatrix<f64>>,
}

/// Linear registration of `img` to `reference`.
///
/// Requesting an inverse matrix computes it from the forward matrix and
/// writes it into the workspace; a singular matrix is a configuration error.
pub fn flirt(
    ws: &Workspace,
    img: impl Into<ImageInput>,
    reference: impl Into<ImageInput>,
    options: &FlirtOptions,
) -> Result<FlirtOutput> {
    let img = ws.input_img(img)?;
    let reference = ws.input_img(reference)?;
    let output = options.common.output_for(&img, "_reg");

    let mut argv = vec![
        "-in".to_string(),
        img.arg(),
        "-ref".to_string(),
        reference.arg(),
        "-out".to_string(),
        output.clone(),
    ];
    argv.extend(options.common.args.to_argv()?);

    let wants_matrix = options.output_mat.is_some() || options.output_invmat.is_some();
    let mat_name = options
        .output_mat
        .clone()
        .unwrap_or_else(|| format!("{output}.mat"));
    let mut outputs = vec![output.as_str()];
    if wants_matrix {
        argv.push("-omat".to_string());
        argv.push(mat_name.clone());
        outputs.push(mat_name.as_str());
    }

    let mut run = run_tool(ws, "flirt", argv, &outputs)?;
    let image = ws.output_img(take_output(ws, &mut run, &output)?, img.kind())?;

    let forward = if wants_matrix {
        let text = run.text.get(base_name(&mat_name)).ok_or_else(|| {
            BasilError::output_recovery(ws.dir().join(&mat_name), "transformation matrix was not produced")
        })?;
        Some(text_to_matrix(text)?)
    } else {
        None
    };

    let inverse = match (&options.output_invmat, &forward) {
        (Some(invmat_name), Some(forward)) => {
            let inverse = forward.clone().try_inverse().ok_or_else(|| {
                ConfigurationError::new("Transformation matrix is singular and cannot be inverted")
                    .with_parameter("output_invmat")
            })?;
            ws.add_text(&matrix_to_text(&inverse), invmat_name)?;
            Some(inverse)
        }
        _ => None,
    };

    Ok(FlirtOutput {
        image,
        matrix: if options.output_mat.is_some() { forward } else { None },
        inverse,
    })
}

/// Applies an existing transformation matrix.
pub fn apply_xfm(
    ws: &Workspace,
    img: impl Into<ImageInput>,
    reference: impl Into<ImageInput>,
    xfm: impl Into<MatrixInput>,
    common: &CommonArgs,
) -> Result<ImageOutput> {
    let img = ws.input_img(img)?;
    let reference = ws.input_img(reference)?;
    let xfm = ws.input_matrix(xfm)?;
    let output = common.output_for(&img, "_reg");

    let mut argv = vec![
        "-in".to_string(),
        img.arg(),
        "-ref".to_string(),
        reference.arg(),
        "-applyxfm".to_string(),
        "-init".to_string(),
        xfm.path().display().to_string(),
        "-out".to_string(),
        output.clone(),
    ];
    argv.extend(common.args.to_argv()?);

    let mut run = run_tool(ws, "flirt", argv, &[output.as_str()])?;
    ws.output_img(take_output(ws, &mut run, &output)?, img.kind())
}

/// Options for [`mcflirt`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct McflirtOptions {
    /// Cost function; the tool default is normalized correlation.
    pub cost: Option<String>,
    /// Reference volume; taken from the input when absent.
    pub reference: Option<ImageInput>,
    /// Output name and extra arguments.
    pub common: CommonArgs,
}

/// Motion correction of a 4D image.
pub fn mcflirt(ws: &Workspace, img: impl Into<ImageInput>, options: &McflirtOptions) -> Result<ImageOutput> {
    let img = ws.input_img(img)?;
    let output = options.common.output_for(&img, "_mc");

    let mut argv = vec!["-in".to_string(), img.arg(), "-out".to_string(), output.clone()];
    argv.extend(options.common.args.to_argv()?);
    if let Some(ref cost) = options.cost {
        argv.push("-cost".to_string());
        argv.push(cost.clone());
    }
    let reference = match options.reference {
        Some(ref reference) => Some(ws.input_img(reference.clone())?),
        None => None,
    };
    if let Some(ref reference) = reference {
        argv.push("-r".to_string());
        argv.push(reference.arg());
    }

    let mut run = run_tool(ws, "mcflirt", argv, &[output.as_str()])?;
    ws.output_img(take_output(ws, &mut run, &output)?, img.kind())
}

/// Voxelwise arithmetic, e.g. `maths(ws, img, "-mul 2 -uthr 7", ..)`.
pub fn maths(
    ws: &Workspace,
    img: impl Into<ImageInput>,
    operations: impl Into<CommandArgs>,
    common: &CommonArgs,
) -> Result<ImageOutput> {
    let img = ws.input_img(img)?;
    let output = common.output_for(&img, "_maths");

    let mut argv = vec![img.arg()];
    argv.extend(operations.into().to_argv()?);
    argv.extend(common.args.to_argv()?);
    argv.push(output.clone());

    let mut run = run_tool(ws, "fslmaths", argv, &[output.as_str()])?;
    ws.output_img(take_output(ws, &mut run, &output)?, img.kind())
}

/// Copies an image, keeping its format.
pub fn imcp(ws: &Workspace, src: impl Into<ImageInput>, dest: impl Into<ImageInput>) -> Result<()> {
    let src = ws.input_img(src)?;
    let dest = ws.input_img(dest)?;
    ws.run("imcp", vec![src.arg(), dest.arg()], &[])?;
    Ok(())
}
