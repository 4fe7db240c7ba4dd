//! Describing a program run and its result.

use crate::cancellation::CancellationToken;
use crate::errors::{BasilError, ConfigurationError, Result};
use crate::image::SandboxImage;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Callback receiving each line of program output as it arrives.
pub type LineObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Command-line arguments for an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArgs {
    /// A single string, split with shell quoting rules.
    Line(String),
    /// Ordered `key value` pairs; a missing or empty value renders the bare key.
    Pairs(Vec<(String, Option<String>)>),
    /// Pre-split arguments.
    List(Vec<String>),
}

impl Default for CommandArgs {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl CommandArgs {
    /// Renders the arguments as an argv vector, program name excluded.
    pub fn to_argv(&self) -> Result<Vec<String>> {
        match self {
            Self::Line(line) => shlex::split(line).ok_or_else(|| {
                BasilError::from(
                    ConfigurationError::new(format!("Could not split arguments: {line}"))
                        .with_parameter("args"),
                )
            }),
            Self::Pairs(pairs) => {
                let mut argv = Vec::with_capacity(pairs.len() * 2);
                for (key, value) in pairs {
                    argv.push(key.clone());
                    if let Some(value) = value.as_ref().filter(|v| !v.is_empty()) {
                        argv.push(value.clone());
                    }
                }
                Ok(argv)
            }
            Self::List(args) => Ok(args.clone()),
        }
    }
}

impl From<&str> for CommandArgs {
    fn from(line: &str) -> Self {
        Self::Line(line.to_string())
    }
}

impl From<String> for CommandArgs {
    fn from(line: String) -> Self {
        Self::Line(line)
    }
}

impl From<Vec<String>> for CommandArgs {
    fn from(args: Vec<String>) -> Self {
        Self::List(args)
    }
}

impl From<Vec<(String, Option<String>)>> for CommandArgs {
    fn from(pairs: Vec<(String, Option<String>)>) -> Self {
        Self::Pairs(pairs)
    }
}

/// A program run, built up before being handed to a workspace.
#[derive(Clone)]
pub struct Invocation {
    pub(crate) program: String,
    pub(crate) args: CommandArgs,
    pub(crate) expected: Vec<String>,
    pub(crate) cancel: Option<Arc<CancellationToken>>,
    pub(crate) observer: Option<LineObserver>,
    pub(crate) timeout: Option<f64>,
}

impl Invocation {
    /// Starts describing a run of `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: CommandArgs::default(),
            expected: Vec::new(),
            cancel: None,
            observer: None,
            timeout: None,
        }
    }

    /// Sets the arguments.
    #[must_use]
    pub fn args(mut self, args: impl Into<CommandArgs>) -> Self {
        self.args = args.into();
        self
    }

    /// Sets the expected output patterns.
    #[must_use]
    pub fn expected<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.expected = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Kills the program when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Calls `observer` for each output line.
    #[must_use]
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Overrides the workspace timeout for this run.
    #[must_use]
    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Program name or path.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Expected output patterns.
    #[must_use]
    pub fn expected_patterns(&self) -> &[String] {
        &self.expected
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("expected", &self.expected)
            .field("cancellable", &self.cancel.is_some())
            .field("observed", &self.observer.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// What a successful run produced.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Returned files that parsed as images, ordered by relative path.
    pub images: Vec<SandboxImage>,
    /// Returned text files, keyed by base name.
    pub text: BTreeMap<String, String>,
    /// Exit code of the program.
    pub exit_code: i32,
    /// Merged stdout and stderr.
    pub output: String,
    /// The command line that was run.
    pub command: String,
}

impl RunOutput {
    /// Finds a returned image by logical name.
    #[must_use]
    pub fn image(&self, name: &str) -> Option<&SandboxImage> {
        self.images.iter().find(|img| img.name() == name)
    }

    /// Removes and returns a returned image by logical name.
    pub fn take_image(&mut self, name: &str) -> Option<SandboxImage> {
        let index = self.images.iter().position(|img| img.name() == name)?;
        Some(self.images.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_line_args_use_shell_quoting() {
        let args = CommandArgs::from("-in 'my data' -out asl_reg -dof 6");
        assert_eq!(
            args.to_argv().unwrap(),
            vec!["-in", "my data", "-out", "asl_reg", "-dof", "6"]
        );
    }

    #[test]
    fn test_unbalanced_quote_is_configuration_error() {
        assert!(CommandArgs::from("-in 'oops").to_argv().is_err());
    }

    #[test]
    fn test_pairs_render_bare_keys() {
        let args = CommandArgs::Pairs(vec![
            ("-in".to_string(), Some("asl".to_string())),
            ("-m".to_string(), None),
            ("-n".to_string(), Some(String::new())),
        ]);
        assert_eq!(args.to_argv().unwrap(), vec!["-in", "asl", "-m", "-n"]);
    }

    #[test]
    fn test_invocation_builder() {
        let token = CancellationToken::new();
        let inv = Invocation::new("fabber_asl")
            .args(vec!["--data=asl".to_string()])
            .expected(["out/"])
            .with_cancellation(token)
            .with_observer(|_| {})
            .with_timeout(5.0);

        assert_eq!(inv.program(), "fabber_asl");
        assert_eq!(inv.expected_patterns(), &["out/".to_string()]);
        assert!(format!("{inv:?}").contains("cancellable: true"));
    }
}
