//! Status, progress and log shared between a pipeline and its caller.

use crate::core::PipelineStatus;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;

/// Mutable state of one pipeline run.
///
/// Transitions only move forward: `Pending` to `Running` to a terminal
/// status. Once terminal, every further update is rejected, so callbacks
/// from an abandoned step cannot change the outcome.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    status: PipelineStatus,
    current_step: Option<usize>,
    completed_steps: usize,
    total_steps: usize,
    log: String,
    error: Option<String>,
    progress: f64,
}

impl PipelineState {
    /// Creates a pending state for `total_steps` steps.
    #[must_use]
    pub fn new(total_steps: usize) -> Self {
        Self {
            status: PipelineStatus::Pending,
            current_step: None,
            completed_steps: 0,
            total_steps,
            log: String::new(),
            error: None,
            progress: 0.0,
        }
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> PipelineStatus {
        self.status
    }

    /// Index of the step in flight.
    #[must_use]
    pub fn current_step(&self) -> Option<usize> {
        self.current_step
    }

    /// Number of steps that completed successfully.
    #[must_use]
    pub fn completed_steps(&self) -> usize {
        self.completed_steps
    }

    /// Number of steps in the pipeline.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Cumulative log.
    #[must_use]
    pub fn log(&self) -> &str {
        &self.log
    }

    /// Message of the error that ended the run.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Overall progress in `[0, 1]`.
    #[must_use]
    pub fn progress(&self) -> f64 {
        self.progress
    }

    /// Appends to the log.
    pub fn append_log(&mut self, text: &str) {
        self.log.push_str(text);
    }

    /// Moves from `Pending` to `Running`.
    pub fn start(&mut self) -> bool {
        if self.status != PipelineStatus::Pending {
            return false;
        }
        self.status = PipelineStatus::Running;
        true
    }

    /// Marks step `index` as in flight.
    pub fn begin_step(&mut self, index: usize) -> bool {
        if self.status != PipelineStatus::Running || index >= self.total_steps {
            return false;
        }
        self.current_step = Some(index);
        true
    }

    /// True if step `index` is in flight and the run is still active.
    #[must_use]
    pub fn is_current(&self, index: usize) -> bool {
        self.status == PipelineStatus::Running && self.current_step == Some(index)
    }

    /// Records the in-flight step's own completion fraction.
    ///
    /// Returns the new overall progress if it increased. Reports for any
    /// other step, or after the run has ended, are ignored.
    pub fn report_progress(&mut self, index: usize, fraction: f64) -> Option<f64> {
        if !self.is_current(index) || fraction.is_nan() || self.total_steps == 0 {
            return None;
        }
        let fraction = fraction.clamp(0.0, 1.0);
        #[allow(clippy::cast_precision_loss)]
        let overall = ((self.completed_steps as f64 + fraction) / self.total_steps as f64).clamp(0.0, 1.0);
        if overall > self.progress {
            self.progress = overall;
            Some(overall)
        } else {
            None
        }
    }

    /// Records the successful completion of the in-flight step.
    pub fn complete_step(&mut self, index: usize) -> bool {
        if !self.is_current(index) {
            return false;
        }
        self.completed_steps += 1;
        self.current_step = None;
        #[allow(clippy::cast_precision_loss)]
        let done = self.completed_steps as f64 / self.total_steps as f64;
        self.progress = self.progress.max(done.min(1.0));
        true
    }

    /// Moves to a terminal status. Returns false if already terminal.
    pub fn finish(&mut self, status: PipelineStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.current_step = None;
        self.error = error;
        if status == PipelineStatus::Succeeded {
            self.progress = 1.0;
        }
        true
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("status".to_string(), json!(self.status));
        map.insert("current_step".to_string(), json!(self.current_step));
        map.insert("completed_steps".to_string(), json!(self.completed_steps));
        map.insert("total_steps".to_string(), json!(self.total_steps));
        map.insert("progress".to_string(), json!(self.progress));
        map.insert("error".to_string(), json!(self.error));
        map
    }
}
