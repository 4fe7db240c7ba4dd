//! Dispatching one step to the fitting program.

use crate::cancellation::CancellationToken;
use crate::core::PipelineStatus;
use crate::errors::{BasilError, Result};
use crate::image::SandboxImage;
use crate::store::ImageStore;
use crate::tools::{fabber, keys, FabberSettings, FitOptions, MVN_NAME};
use crate::workspace::{ImageOutput, LineObserver, Workspace};
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::debug;

static PROGRESS_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").ok());

/// Store name of the posterior passed from one step to the next.
pub const CONTINUATION_ARTIFACT: &str = MVN_NAME;

/// Names under which summary outputs are stored.
pub const OUTPUT_RENAMES: [(&str, &str); 6] = [
    ("mean_ftiss", "perfusion"),
    ("mean_deltiss", "arrival"),
    ("mean_fblood", "aCBV"),
    ("std_ftiss", "perfusion_std"),
    ("std_deltiss", "arrival_std"),
    ("std_fblood", "aCBV_std"),
];

/// Receives the in-flight step's completion fraction in `[0, 1]`.
pub type ProgressReporter = Arc<dyn Fn(f64) + Send + Sync>;

/// Everything a runner needs to execute one step.
#[derive(Debug, Clone)]
pub struct StepRequest {
    /// 1-based step number.
    pub number: usize,
    /// Step description.
    pub description: String,
    /// Model group, selecting the `fabber_<group>` program.
    pub model_group: String,
    /// Input data.
    pub data: SandboxImage,
    /// Fitting mask.
    pub mask: SandboxImage,
    /// Final option set, including save flags.
    pub options: FitOptions,
    /// Store name of the posterior to continue from.
    pub continue_from: Option<String>,
    /// Store names for outputs, keyed by the program's output name.
    pub output_rename: BTreeMap<String, String>,
    /// True for the last step.
    pub is_final: bool,
}

impl StepRequest {
    /// Store name for output `name`.
    #[must_use]
    pub fn stored_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.output_rename.get(name).map_or(name, String::as_str)
    }
}

/// How a step ended.
#[derive(Debug)]
pub struct StepCompletion {
    /// `Succeeded`, `Failed` or `Cancelled`.
    pub status: PipelineStatus,
    /// Output of the step, appended to the pipeline log.
    pub log: String,
    /// The error, for unsuccessful steps.
    pub error: Option<BasilError>,
}

impl StepCompletion {
    /// A successful completion.
    #[must_use]
    pub fn succeeded(log: impl Into<String>) -> Self {
        Self {
            status: PipelineStatus::Succeeded,
            log: log.into(),
            error: None,
        }
    }

    /// An unsuccessful completion; cancellations report `Cancelled`.
    #[must_use]
    pub fn from_error(error: BasilError) -> Self {
        let status = if error.is_cancellation() {
            PipelineStatus::Cancelled
        } else {
            PipelineStatus::Failed
        };
        let log = match error.captured_output() {
            Some(output) => format!("{output}\n{error}"),
            None => error.to_string(),
        };
        Self {
            status,
            log,
            error: Some(error),
        }
    }

    /// True if the step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Executes pipeline steps.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Runs one step to completion.
    ///
    /// `progress` may be called any number of times while the step runs.
    /// The runner must stop early once `cancel` is cancelled.
    async fn run_step(
        &self,
        request: StepRequest,
        progress: ProgressReporter,
        cancel: Arc<CancellationToken>,
    ) -> StepCompletion;
}

/// Runs steps with the fitting program inside a workspace.
///
/// Each step writes to `step<N>` in the workspace. The posterior of every
/// step is stored as [`CONTINUATION_ARTIFACT`] and stays file-backed; other
/// outputs are loaded into memory and stored under their renamed names. Progress is read from percentages printed by
/// the program.
pub struct WorkspaceStepRunner {
    workspace: Arc<Workspace>,
    store: Arc<dyn ImageStore>,
}

impl fmt::Debug for WorkspaceStepRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceStepRunner")
            .field("workspace", &self.workspace)
            .finish_non_exhaustive()
    }
}

/// Extracts the last percentage on a line as a fraction.
fn parse_progress(line: &str) -> Option<f64> {
    let last = PROGRESS_PATTERN.as_ref()?.captures_iter(line).last()?;
    let percent: f64 = last.get(1)?.as_str().parse().ok()?;
    Some((percent / 100.0).clamp(0.0, 1.0))
}

fn output_image(output: ImageOutput, name: &str) -> SandboxImage {
    match output {
        ImageOutput::Path(path) => SandboxImage::from_path(path),
        ImageOutput::Image(image) => image,
        ImageOutput::Array(data) => SandboxImage::from_array(name, data),
    }
}

/// Loads an output into memory so it outlives the workspace directory.
fn stored_image(output: ImageOutput, name: &str) -> Result<SandboxImage> {
    Ok(output_image(output, name).detach()?)
}

impl WorkspaceStepRunner {
    /// Creates a runner using `workspace` for files and `store` for images.
    #[must_use]
    pub fn new(workspace: Arc<Workspace>, store: Arc<dyn ImageStore>) -> Self {
        Self { workspace, store }
    }

    /// The workspace steps run in.
    #[must_use]
    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    fn run_blocking(
        ws: &Workspace,
        store: &dyn ImageStore,
        request: StepRequest,
        progress: ProgressReporter,
        cancel: Arc<CancellationToken>,
    ) -> Result<String> {
        let mut options = request.options.clone();
        if let Some(ref name) = request.continue_from {
            options.set(keys::CONTINUE_FROM_MVN, store.require(name)?);
        }

        let reporter = progress.clone();
        let observer: LineObserver = Arc::new(move |line: &str| {
            if let Some(fraction) = parse_progress(line) {
                reporter(fraction);
            }
        });
        let settings = FabberSettings {
            output_name: Some(format!("step{}", request.number)),
            cancel: Some(cancel),
            observer: Some(observer),
            ..FabberSettings::default()
        };

        let out = fabber(ws, &request.model_group, &request.data, &request.mask, &options, settings)?;

        store.add(CONTINUATION_ARTIFACT, output_image(out.mvn, CONTINUATION_ARTIFACT));
        for (name, image) in out.images {
            let stored = request.stored_name(&name).to_string();
            debug!(step = request.number, output = %name, stored = %stored, "Storing step output");
            store.add(&stored, stored_image(image, &stored)?);
        }

        progress(1.0);
        Ok(out.log)
    }
}

#[async_trait]
impl StepRunner for WorkspaceStepRunner {
    async fn run_step(
        &self,
        request: StepRequest,
        progress: ProgressReporter,
        cancel: Arc<CancellationToken>,
    ) -> StepCompletion {
        let ws = self.workspace.clone();
        let store = self.store.clone();
        let number = request.number;

        let joined = tokio::task::spawn_blocking(move || {
            Self::run_blocking(&ws, store.as_ref(), request, progress, cancel)
        })
        .await;

        match joined {
            Ok(Ok(log)) => StepCompletion::succeeded(log),
            Ok(Err(err)) => StepCompletion::from_error(err),
            Err(err) => StepCompletion::from_error(BasilError::Internal(format!("Step {number} task failed: {err}"))),
        }
    }
}
