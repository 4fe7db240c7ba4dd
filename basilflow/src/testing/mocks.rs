//! Mock step runners for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::errors::BasilError;
use crate::image::{SandboxImage, VoxelArray};
use crate::pipeline::{ProgressReporter, StepCompletion, StepRequest, StepRunner, CONTINUATION_ARTIFACT};
use crate::store::ImageStore;

/// Scripted behaviour of one step.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedStep {
    /// Reports each progress value in turn, then succeeds.
    Succeed {
        /// Fractions passed to the progress reporter.
        progress: Vec<f64>,
        /// Step log.
        log: String,
    },
    /// Fails as if the program exited with `exit_code`.
    Fail {
        /// Captured program output.
        log: String,
        /// Exit code.
        exit_code: i32,
    },
    /// Waits until cancelled, then reports cancellation.
    WaitForCancel,
}

impl ScriptedStep {
    /// A step that reports half and full progress and succeeds.
    #[must_use]
    pub fn succeed(log: impl Into<String>) -> Self {
        Self::Succeed {
            progress: vec![0.5, 1.0],
            log: log.into(),
        }
    }

    /// A step that exits with status 1.
    #[must_use]
    pub fn fail(log: impl Into<String>) -> Self {
        Self::Fail {
            log: log.into(),
            exit_code: 1,
        }
    }
}

/// A step runner that follows a script and records every request.
///
/// Steps beyond the end of the script succeed. With a store attached,
/// successful steps store a continuation artifact and steps that continue
/// from one fail if it is missing, as the workspace runner does.
#[derive(Default)]
pub struct ScriptedStepRunner {
    script: Mutex<VecDeque<ScriptedStep>>,
    requests: Mutex<Vec<StepRequest>>,
    reporters: Mutex<Vec<ProgressReporter>>,
    store: Option<Arc<dyn ImageStore>>,
}

impl fmt::Debug for ScriptedStepRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedStepRunner")
            .field("script", &*self.script.lock())
            .field("calls", &self.requests.lock().len())
            .finish_non_exhaustive()
    }
}

impl ScriptedStepRunner {
    /// Creates a runner whose steps all succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner following `steps` in order.
    #[must_use]
    pub fn with_steps(steps: impl IntoIterator<Item = ScriptedStep>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Stores continuation artifacts in `store`.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ImageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<StepRequest> {
        self.requests.lock().clone()
    }

    /// Number of steps run.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Progress reporter handed to the most recent step.
    #[must_use]
    pub fn last_reporter(&self) -> Option<ProgressReporter> {
        self.reporters.lock().last().cloned()
    }

    fn missing_continuation(&self, request: &StepRequest) -> Option<BasilError> {
        let store = self.store.as_ref()?;
        let name = request.continue_from.as_ref()?;
        (!store.contains(name)).then(|| BasilError::not_found(name.clone()))
    }
}

#[async_trait]
impl StepRunner for ScriptedStepRunner {
    async fn run_step(
        &self,
        request: StepRequest,
        progress: ProgressReporter,
        cancel: Arc<CancellationToken>,
    ) -> StepCompletion {
        self.requests.lock().push(request.clone());
        self.reporters.lock().push(progress.clone());
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedStep::succeed(format!("{} finished", request.description)));

        if let Some(err) = self.missing_continuation(&request) {
            return StepCompletion::from_error(err);
        }

        match step {
            ScriptedStep::Succeed { progress: fractions, log } => {
                for fraction in fractions {
                    progress(fraction);
                }
                if let (Some(store), Ok(data)) = (&self.store, VoxelArray::zeros(vec![1, 1, 1])) {
                    store.add(CONTINUATION_ARTIFACT, SandboxImage::from_array(CONTINUATION_ARTIFACT, data));
                }
                StepCompletion::succeeded(log)
            }
            ScriptedStep::Fail { log, exit_code } => StepCompletion::from_error(BasilError::Invocation {
                program: format!("fabber_{}", request.model_group),
                command: format!("fabber_{} {}", request.model_group, request.description),
                exit_code: Some(exit_code),
                output: log,
            }),
            ScriptedStep::WaitForCancel => {
                while !cancel.is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                StepCompletion::from_error(BasilError::Cancelled(cancel.reason().unwrap_or_default()))
            }
        }
    }
}
