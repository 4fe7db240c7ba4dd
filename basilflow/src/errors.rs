//! Error types for basilflow.
//!
//! Configuration and missing-resource errors are raised synchronously while a
//! pipeline is being built. Invocation and output-recovery errors only ever
//! reach callers through a pipeline's terminal outcome.

use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = BasilError> = std::result::Result<T, E>;

/// The main error type for basilflow operations.
#[derive(Debug, Error)]
pub enum BasilError {
    /// Missing or inconsistent parameters.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A named dataset was not found in the image store.
    #[error("Data not found: {name}")]
    ResourceNotFound {
        /// The dataset name that was requested.
        name: String,
    },

    /// An external program exited unsuccessfully or could not be started.
    #[error("Command '{command}': {}", describe_exit(.exit_code))]
    Invocation {
        /// The program that was run.
        program: String,
        /// The full command line.
        command: String,
        /// Exit code, if the program exited normally.
        exit_code: Option<i32>,
        /// Captured stdout and stderr.
        output: String,
    },

    /// A file changed in the workspace but could not be read back.
    #[error("Could not handle output file {}: {reason}", .path.display())]
    OutputRecovery {
        /// Path of the offending file.
        path: PathBuf,
        /// Why it could not be handled.
        reason: String,
    },

    /// The caller cancelled the operation.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// An external program exceeded the configured timeout.
    #[error("Command '{program}' timed out after {seconds:.1}s")]
    Timeout {
        /// The program that was run.
        program: String,
        /// The timeout that elapsed.
        seconds: f64,
    },

    /// Image decoding or encoding failed.
    #[error("{0}")]
    Image(#[from] ImageError),

    /// Matrix text could not be parsed.
    #[error("{0}")]
    MatrixParse(#[from] MatrixParseError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("Non-zero output status: {code}"),
        None => "terminated without an exit status".to_string(),
    }
}

impl BasilError {
    /// Creates a resource-not-found error.
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::ResourceNotFound { name: name.into() }
    }

    /// Creates an output-recovery error.
    #[must_use]
    pub fn output_recovery(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::OutputRecovery {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error was caused by caller cancellation.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns the captured program output carried by the error, if any.
    #[must_use]
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Self::Invocation { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();

        let kind = match self {
            Self::Configuration(err) => {
                if let Some(ref parameter) = err.parameter {
                    map.insert("parameter".to_string(), json!(parameter));
                }
                "ConfigurationError"
            }
            Self::ResourceNotFound { name } => {
                map.insert("name".to_string(), json!(name));
                "ResourceNotFound"
            }
            Self::Invocation {
                program, exit_code, ..
            } => {
                map.insert("program".to_string(), json!(program));
                map.insert("exit_code".to_string(), json!(exit_code));
                "InvocationError"
            }
            Self::OutputRecovery { path, .. } => {
                map.insert("path".to_string(), json!(path.display().to_string()));
                "OutputRecoveryError"
            }
            Self::Cancelled(_) => "Cancelled",
            Self::Timeout { program, seconds } => {
                map.insert("program".to_string(), json!(program));
                map.insert("timeout_seconds".to_string(), json!(seconds));
                "Timeout"
            }
            Self::Image(_) => "ImageError",
            Self::MatrixParse(_) => "MatrixParseError",
            Self::Io(_) => "IoError",
            Self::Internal(_) => "InternalError",
        };

        map.insert("type".to_string(), json!(kind));
        map.insert("message".to_string(), json!(self.to_string()));
        map
    }
}

/// Error raised when parameters are missing or inconsistent.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The parameter at fault, if known.
    pub parameter: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            parameter: None,
        }
    }

    /// Sets the parameter at fault.
    #[must_use]
    pub fn with_parameter(mut self, parameter: impl Into<String>) -> Self {
        self.parameter = Some(parameter.into());
        self
    }
}

/// Errors from the image codec and image bookkeeping.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The file is not a readable image.
    #[error("{}: not a NIfTI image ({reason})", .path.display())]
    NotAnImage {
        /// The file that was inspected.
        path: PathBuf,
        /// Why it was rejected.
        reason: String,
    },

    /// The on-disk voxel type is not supported.
    #[error("Unsupported NIfTI datatype code {0}")]
    UnsupportedDatatype(i16),

    /// Shape does not match the number of values, or another shape.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// The image has no file and no in-memory data.
    #[error("Image '{0}' has no data")]
    NoData(String),

    /// IO error while reading or writing.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the matrix text format.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MatrixParseError {
    /// A row has a different number of columns from the first row.
    #[error("File must contain a matrix of numbers with fixed size (rows/columns): line {line} has {found} columns, expected {expected}")]
    RaggedRow {
        /// 1-based line number.
        line: usize,
        /// Columns in the first row.
        expected: usize,
        /// Columns found on this line.
        found: usize,
    },

    /// A token could not be parsed as a number.
    #[error("Non-numeric value '{token}' found in matrix text (line {line})")]
    NonNumeric {
        /// 1-based line number.
        line: usize,
        /// The offending token.
        token: String,
    },
}
