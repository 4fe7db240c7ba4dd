//! Wrapper for the `fabber_<group>` model-fitting programs.

use super::options::{keys, FitOptions, OptionValue};
use crate::cancellation::CancellationToken;
use crate::errors::{BasilError, Result};
use crate::workspace::{ImageInput, ImageOutput, Invocation, LineObserver, Workspace};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Name under which the fitting program saves its posterior.
pub const MVN_NAME: &str = "finalMVN";

/// Run settings for [`fabber`] that are not fitting options.
#[derive(Clone)]
pub struct FabberSettings {
    /// Replace an existing output directory.
    pub overwrite: bool,
    /// Output directory name; defaults to the data name plus `_fabber`.
    pub output_name: Option<String>,
    /// Extra raw arguments.
    pub args: Vec<String>,
    /// Cancels the running program.
    pub cancel: Option<Arc<CancellationToken>>,
    /// Receives each output line.
    pub observer: Option<LineObserver>,
}

impl Default for FabberSettings {
    fn default() -> Self {
        Self {
            overwrite: true,
            output_name: None,
            args: Vec::new(),
            cancel: None,
            observer: None,
        }
    }
}

impl fmt::Debug for FabberSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FabberSettings")
            .field("overwrite", &self.overwrite)
            .field("output_name", &self.output_name)
            .field("args", &self.args)
            .field("cancellable", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

/// Results of a model fit.
#[derive(Debug, Clone)]
pub struct FabberOutput {
    /// The saved posterior, used to warm-start a later fit.
    pub mvn: ImageOutput,
    /// Every other image in the output directory, keyed by name.
    pub images: BTreeMap<String, ImageOutput>,
    /// Text files in the output directory, keyed by name (e.g. `logfile`).
    pub text: BTreeMap<String, String>,
    /// Output directory inside the workspace.
    pub output_dir: PathBuf,
    /// Merged program output.
    pub log: String,
}

/// Runs `fabber_<model_group>` on `img` within `mask`.
///
/// Data, mask, output directory, posterior saving and overwrite are
/// scaffolding and replace any caller-supplied values for those keys.
pub fn fabber(
    ws: &Workspace,
    model_group: &str,
    img: impl Into<ImageInput>,
    mask: impl Into<ImageInput>,
    options: &FitOptions,
    settings: FabberSettings,
) -> Result<FabberOutput> {
    let img = ws.input_img(img)?;
    let mask = ws.input_img(mask)?;
    let output = settings
        .output_name
        .clone()
        .unwrap_or_else(|| format!("{}_fabber", img.name()));

    let scaffold = FitOptions::new()
        .with(keys::DATA, img.arg())
        .with(keys::MASK, mask.arg())
        .with(keys::OUTPUT, output.clone())
        .with(keys::SAVE_MVN, true)
        .with(keys::OVERWRITE, OptionValue::Flag(settings.overwrite));

    let mut merged = options.materialize(ws)?;
    merged.apply_scaffold(&scaffold);

    let mut argv = merged.to_flags()?;
    argv.extend(settings.args.iter().cloned());

    let program = format!("fabber_{}", model_group.to_lowercase());
    let mut inv = Invocation::new(program)
        .args(argv)
        .expected([format!("{}/", regex::escape(&output))]);
    if let Some(token) = settings.cancel {
        inv = inv.with_cancellation(token);
    }
    if let Some(observer) = settings.observer {
        inv.observer = Some(observer);
    }

    let mut run = ws.execute(inv)?;
    let output_dir = ws.dir().join(&output);
    let mvn = run
        .take_image(MVN_NAME)
        .ok_or_else(|| BasilError::output_recovery(output_dir.join(MVN_NAME), "posterior was not saved"))?;

    let mut images = BTreeMap::new();
    for image in run.images {
        images.insert(image.name().to_string(), ws.output_img(image, img.kind())?);
    }

    Ok(FabberOutput {
        mvn: ws.output_img(mvn, img.kind())?,
        images,
        text: run.text,
        output_dir,
        log: run.output,
    })
}
