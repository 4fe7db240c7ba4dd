//! Workspace configuration.
//!
//! Configuration is a plain serde struct with builder methods. The output
//! format and program search path default from the FSL environment but are
//! carried as values and handed to each child process explicitly, so nothing
//! mutates the process environment.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// On-disk format requested from external programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    /// Uncompressed NIfTI-1 (`.nii`).
    Nifti,
    /// Gzip-compressed NIfTI-1 (`.nii.gz`).
    #[default]
    NiftiGz,
}

impl OutputType {
    /// File extension for this output type, including the leading dot.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Nifti => ".nii",
            Self::NiftiGz => ".nii.gz",
        }
    }

    /// Value of `FSLOUTPUTTYPE` for this output type.
    #[must_use]
    pub fn env_value(&self) -> &'static str {
        match self {
            Self::Nifti => "NIFTI",
            Self::NiftiGz => "NIFTI_GZ",
        }
    }

    /// Parses an `FSLOUTPUTTYPE` value. Unknown values yield `None`.
    #[must_use]
    pub fn from_env_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "NIFTI" => Some(Self::Nifti),
            "NIFTI_GZ" => Some(Self::NiftiGz),
            _ => None,
        }
    }
}

fn default_echo() -> bool {
    false
}

fn default_poll_interval_ms() -> u64 {
    20
}

fn default_use_local_dir() -> bool {
    true
}

/// Configuration for an execution workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Directories searched for external programs, in order.
    ///
    /// `None` means "derive from the environment" (see
    /// [`WorkspaceConfig::resolved_search_path`]).
    #[serde(default)]
    pub search_path: Option<Vec<PathBuf>>,

    /// Echo each command line to the log sink before running it.
    #[serde(default = "default_echo")]
    pub echo: bool,

    /// Emit debug-level tracing for file classification.
    #[serde(default)]
    pub debug: bool,

    /// Output format requested from external programs.
    #[serde(default)]
    pub output_type: OutputType,

    /// Put the running executable's directory first on the derived search path.
    #[serde(default = "default_use_local_dir")]
    pub use_local_dir: bool,

    /// Kill an external program after this many seconds.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,

    /// How often a running program is polled for exit or cancellation.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(skip)]
    fsldir: Option<PathBuf>,

    #[serde(skip)]
    fsldevdir: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            search_path: None,
            echo: default_echo(),
            debug: false,
            output_type: OutputType::default(),
            use_local_dir: default_use_local_dir(),
            timeout_seconds: None,
            poll_interval_ms: default_poll_interval_ms(),
            fsldir: None,
            fsldevdir: None,
        }
    }
}

impl WorkspaceConfig {
    /// Creates a default configuration with no FSL directories.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration from `FSLDIR`, `FSLDEVDIR` and `FSLOUTPUTTYPE`.
    #[must_use]
    pub fn from_env() -> Self {
        let non_empty = |key: &str| {
            std::env::var_os(key)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };

        let mut config = Self {
            fsldir: non_empty("FSLDIR"),
            fsldevdir: non_empty("FSLDEVDIR"),
            ..Self::default()
        };

        if let Ok(value) = std::env::var("FSLOUTPUTTYPE") {
            match OutputType::from_env_value(&value) {
                Some(output_type) => config.output_type = output_type,
                None => tracing::warn!(value = %value, "Unsupported FSLOUTPUTTYPE, using NIFTI_GZ"),
            }
        }
        config
    }

    /// Sets an explicit program search path.
    #[must_use]
    pub fn with_search_path<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.search_path = Some(dirs.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the FSL installation directory.
    #[must_use]
    pub fn with_fsldir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fsldir = Some(dir.into());
        self
    }

    /// Sets the FSL development directory.
    #[must_use]
    pub fn with_fsldevdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fsldevdir = Some(dir.into());
        self
    }

    /// Sets whether commands are echoed to the log.
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Sets debug mode.
    #[must_use]
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Sets the output type.
    #[must_use]
    pub fn with_output_type(mut self, output_type: OutputType) -> Self {
        self.output_type = output_type;
        self
    }

    /// Sets whether the executable's own directory is searched first.
    #[must_use]
    pub fn with_use_local_dir(mut self, use_local_dir: bool) -> Self {
        self.use_local_dir = use_local_dir;
        self
    }

    /// Sets the per-invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    /// Sets the poll interval for running programs.
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms.max(1);
        self
    }

    /// Returns the effective search path.
    ///
    /// An explicit search path is returned as is. Otherwise the path is the
    /// executable's directory (when `use_local_dir` is set), then
    /// `$FSLDEVDIR/bin`, then `$FSLDIR/bin`.
    #[must_use]
    pub fn resolved_search_path(&self) -> Vec<PathBuf> {
        if let Some(ref dirs) = self.search_path {
            return dirs.clone();
        }

        let mut dirs = Vec::new();
        if self.use_local_dir {
            if let Some(dir) = std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(PathBuf::from))
            {
                dirs.push(dir);
            }
        }
        if let Some(ref dev) = self.fsldevdir {
            dirs.push(dev.join("bin"));
        }
        if let Some(ref fsl) = self.fsldir {
            dirs.push(fsl.join("bin"));
        }
        dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_output_type_defaults_to_gz() {
        let config = WorkspaceConfig::default();
        assert_eq!(config.output_type, OutputType::NiftiGz);
        assert_eq!(config.output_type.extension(), ".nii.gz");
        assert_eq!(config.output_type.env_value(), "NIFTI_GZ");
    }

    #[test]
    fn test_output_type_from_env_value() {
        assert_eq!(OutputType::from_env_value("NIFTI"), Some(OutputType::Nifti));
        assert_eq!(OutputType::from_env_value("nifti_gz"), Some(OutputType::NiftiGz));
        assert_eq!(OutputType::from_env_value("ANALYZE"), None);
    }

    #[test]
    fn test_search_path_order() {
        let config = WorkspaceConfig::new()
            .with_use_local_dir(false)
            .with_fsldir("/opt/fsl")
            .with_fsldevdir("/home/dev/fsl");

        assert_eq!(
            config.resolved_search_path(),
            vec![PathBuf::from("/home/dev/fsl/bin"), PathBuf::from("/opt/fsl/bin")]
        );
    }

    #[test]
    fn test_explicit_search_path_wins() {
        let config = WorkspaceConfig::new()
            .with_fsldir("/opt/fsl")
            .with_search_path(["/tmp/bin"]);

        assert_eq!(config.resolved_search_path(), vec![PathBuf::from("/tmp/bin")]);
    }

    #[test]
    fn test_local_dir_first() {
        let config = WorkspaceConfig::new().with_fsldir("/opt/fsl");
        let dirs = config.resolved_search_path();

        assert_eq!(dirs.len(), 2);
        assert_eq!(dirs[1], PathBuf::from("/opt/fsl/bin"));
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let config: WorkspaceConfig = serde_json::from_str(r#"{"echo": true}"#).unwrap();
        assert!(config.echo);
        assert_eq!(config.poll_interval_ms, 20);
        assert!(config.use_local_dir);
        assert!(config.timeout_seconds.is_none());
    }
}
