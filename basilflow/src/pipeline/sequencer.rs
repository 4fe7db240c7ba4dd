//! Running a step list one step at a time.

use super::runner::{ProgressReporter, StepCompletion, StepRequest, StepRunner, CONTINUATION_ARTIFACT, OUTPUT_RENAMES};
use super::state::PipelineState;
use super::steps::{build_steps, AnalysisOptions, FitStep};
use crate::asl::AslImage;
use crate::cancellation::CancellationToken;
use crate::core::PipelineStatus;
use crate::errors::{BasilError, ConfigurationError, Result};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::image::SandboxImage;
use crate::observability::StepTimer;
use crate::store::ImageStore;
use crate::tools::{keys, FitOptions};
use crate::utils::iso_timestamp;
use parking_lot::Mutex;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What the pipeline does after a step completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Dispatch the step with this index.
    Dispatch(usize),
    /// The pipeline reached a terminal status.
    Finished,
    /// The completion was stale and changed nothing.
    Ignored,
}

/// Terminal result of a pipeline run.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// Terminal status.
    pub status: PipelineStatus,
    /// Cumulative log.
    pub log: String,
    /// Final overall progress.
    pub progress: f64,
    /// Number of steps that succeeded.
    pub completed_steps: usize,
    /// Error of the step that ended the run.
    pub error: Option<Arc<BasilError>>,
}

impl PipelineOutcome {
    /// True if every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// A staged model fit over ASL data.
///
/// Build errors (bad acquisition structure, missing stored images) are
/// returned from [`BasilPipeline::build`]. Errors from the fitting program
/// only appear in the [`PipelineOutcome`] of [`BasilPipeline::run`].
pub struct BasilPipeline {
    steps: Vec<FitStep>,
    model_group: String,
    state: Arc<Mutex<PipelineState>>,
    store: Arc<dyn ImageStore>,
    runner: Arc<dyn StepRunner>,
    events: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
    timer: Mutex<Option<StepTimer>>,
    error: Mutex<Option<Arc<BasilError>>>,
}

impl fmt::Debug for BasilPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasilPipeline")
            .field("steps", &self.steps.len())
            .field("model_group", &self.model_group)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl BasilPipeline {
    /// Builds the step list for `asl` within `mask`.
    pub fn build(
        asl: &AslImage,
        mask: &SandboxImage,
        options: &AnalysisOptions,
        store: Arc<dyn ImageStore>,
        runner: Arc<dyn StepRunner>,
    ) -> Result<Self> {
        let steps = build_steps(asl, mask, options, store.as_ref())?;
        Self::from_steps(steps, &options.model_group, store, runner)
    }

    /// Creates a pipeline from a prepared step list.
    pub fn from_steps(
        steps: Vec<FitStep>,
        model_group: &str,
        store: Arc<dyn ImageStore>,
        runner: Arc<dyn StepRunner>,
    ) -> Result<Self> {
        if steps.is_empty() {
            return Err(ConfigurationError::new("A pipeline needs at least one step").into());
        }
        debug!(steps = steps.len(), model_group = %model_group, "Built pipeline");
        Ok(Self {
            state: Arc::new(Mutex::new(PipelineState::new(steps.len()))),
            steps,
            model_group: model_group.to_string(),
            store,
            runner,
            events: Arc::new(NoOpEventSink),
            cancel: CancellationToken::new(),
            timer: Mutex::new(None),
            error: Mutex::new(None),
        })
    }

    /// Sends lifecycle events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// The steps, in run order.
    #[must_use]
    pub fn steps(&self) -> &[FitStep] {
        &self.steps
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        self.state.lock().status()
    }

    /// Current overall progress.
    #[must_use]
    pub fn progress(&self) -> f64 {
        self.state.lock().progress()
    }

    /// Copy of the cumulative log.
    #[must_use]
    pub fn log(&self) -> String {
        self.state.lock().log().to_string()
    }

    /// Snapshot of the state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.state.lock().clone()
    }

    /// Token that cancels the run.
    #[must_use]
    pub fn cancellation_token(&self) -> Arc<CancellationToken> {
        self.cancel.clone()
    }

    /// Asks the step in flight to stop. Completed steps are kept.
    pub fn cancel(&self, reason: impl Into<String>) {
        self.cancel.cancel(reason);
    }

    /// Runs every step in order and returns the terminal outcome.
    ///
    /// A pipeline runs once; later calls return the existing outcome.
    pub async fn run(&self) -> PipelineOutcome {
        if !self.state.lock().start() {
            warn!(status = %self.status(), "Pipeline has already been run");
            return self.outcome();
        }

        let total = self.steps.len();
        info!(steps = total, model_group = %self.model_group, "Starting pipeline");
        self.events
            .emit(
                names::PIPELINE_STARTED,
                Some(json!({ "total_steps": total, "timestamp": iso_timestamp() })),
            )
            .await;

        let mut next = Some(0);
        while let Some(index) = next {
            if self.cancel.is_cancelled() {
                self.finish_before_dispatch();
                break;
            }
            let Some(request) = self.dispatch(index) else {
                break;
            };
            self.events
                .emit(
                    names::STEP_STARTED,
                    Some(json!({ "step": request.number, "description": request.description })),
                )
                .await;

            let completion = self
                .runner
                .run_step(request, self.reporter(index), self.cancel.clone())
                .await;

            next = match self.advance(index, completion) {
                Advance::Dispatch(next_index) => Some(next_index),
                Advance::Finished | Advance::Ignored => None,
            };
        }

        let outcome = self.outcome();
        self.events
            .emit(
                names::FINISHED,
                Some(json!({
                    "status": outcome.status,
                    "completed_steps": outcome.completed_steps,
                    "timestamp": iso_timestamp(),
                })),
            )
            .await;
        outcome
    }

    /// Builds the request for step `index` and records it as in flight.
    fn dispatch(&self, index: usize) -> Option<StepRequest> {
        let step = self.steps.get(index)?;
        let mut state = self.state.lock();
        if !state.begin_step(index) {
            return None;
        }

        let mut description = step.description.clone();
        if let Some(prev) = step.prev_step {
            description.push_str(&format!(" - init with STEP {prev}"));
        }
        state.append_log(&format!("{description}\n\n"));
        drop(state);

        let mut scaffold = FitOptions::new();
        if step.is_final {
            scaffold.flag(keys::SAVE_MEAN).flag(keys::SAVE_STD).flag(keys::SAVE_MODEL_FIT);
        } else {
            scaffold.flag(keys::SAVE_MVN);
        }
        let mut options = step.options.clone();
        options.apply_scaffold(&scaffold);

        info!(step = step.number, description = %description, "Starting step");
        *self.timer.lock() = Some(StepTimer::start(description.clone()));

        Some(StepRequest {
            number: step.number,
            description,
            model_group: self.model_group.clone(),
            data: step.data.clone(),
            mask: step.mask.clone(),
            options,
            continue_from: step.prev_step.map(|_| CONTINUATION_ARTIFACT.to_string()),
            output_rename: OUTPUT_RENAMES
                .iter()
                .map(|(from, to)| ((*from).to_string(), (*to).to_string()))
                .collect(),
            is_final: step.is_final,
        })
    }

    fn reporter(&self, index: usize) -> ProgressReporter {
        let state = self.state.clone();
        let events = self.events.clone();
        Arc::new(move |fraction: f64| {
            let overall = state.lock().report_progress(index, fraction);
            if let Some(progress) = overall {
                events.try_emit(names::PROGRESS, Some(json!({ "step": index + 1, "progress": progress })));
            }
        })
    }

    /// Applies the completion of step `index`.
    ///
    /// Completions for a step that is no longer in flight, or that arrive
    /// after the pipeline ended, are ignored.
    pub fn advance(&self, index: usize, completion: StepCompletion) -> Advance {
        let mut state = self.state.lock();
        if !state.is_current(index) {
            debug!(step = index + 1, status = %state.status(), "Ignoring stale step completion");
            return Advance::Ignored;
        }

        let number = index + 1;
        let seconds = self.timer.lock().take().map_or(0.0, StepTimer::finish);
        state.append_log(&completion.log);
        state.append_log("\n\n");

        if completion.status == PipelineStatus::Succeeded {
            state.complete_step(index);
            state.append_log(&format!("DONE ({seconds:.1}s)\n\n"));
            self.events.try_emit(
                names::STEP_COMPLETED,
                Some(json!({ "step": number, "status": PipelineStatus::Succeeded, "duration_s": seconds })),
            );

            if number < self.steps.len() {
                debug!(step = number, "Step complete");
                return Advance::Dispatch(index + 1);
            }

            state.append_log("COMPLETE\n");
            state.finish(PipelineStatus::Succeeded, None);
            drop(state);
            if self.store.remove(CONTINUATION_ARTIFACT).is_some() {
                debug!("Removed continuation artifact from store");
            }
            info!(steps = number, status = %PipelineStatus::Succeeded, "Pipeline complete");
            return Advance::Finished;
        }

        let status = if completion.status.is_failure() {
            completion.status
        } else {
            PipelineStatus::Failed
        };
        let message = completion
            .error
            .as_ref()
            .map_or_else(|| format!("Step {number} did not succeed"), ToString::to_string);
        state.append_log("CANCELLED\n");
        state.finish(status, Some(message.clone()));
        drop(state);

        if status == PipelineStatus::Cancelled {
            info!(step = number, status = %status, "Pipeline cancelled");
        } else {
            warn!(step = number, status = %status, error = %message, "Pipeline step failed");
        }
        self.events.try_emit(
            names::STEP_COMPLETED,
            Some(json!({ "step": number, "status": status, "error": message })),
        );
        *self.error.lock() = completion.error.map(Arc::new);
        Advance::Finished
    }

    fn finish_before_dispatch(&self) {
        let reason = self.cancel.reason().unwrap_or_default();
        let mut state = self.state.lock();
        state.append_log("CANCELLED\n");
        state.finish(PipelineStatus::Cancelled, Some(reason.clone()));
        drop(state);
        info!(reason = %reason, "Pipeline cancelled before dispatch");
        *self.error.lock() = Some(Arc::new(BasilError::Cancelled(reason)));
    }

    fn outcome(&self) -> PipelineOutcome {
        let state = self.state.lock();
        PipelineOutcome {
            status: state.status(),
            log: state.log().to_string(),
            progress: state.progress(),
            completed_steps: state.completed_steps(),
            error: self.error.lock().clone(),
        }
    }
}
