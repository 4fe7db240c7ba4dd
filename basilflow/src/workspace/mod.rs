//! Sandboxed execution workspaces.
//!
//! A [`Workspace`] owns a directory in which external programs run. Inputs
//! are written into it as files, each program runs with it as the current
//! directory, and outputs are recovered by comparing recursive file
//! snapshots taken before and after the run (or by matching declared output
//! patterns).

mod invocation;
mod io;
mod log;
pub mod snapshot;

pub use invocation::{CommandArgs, Invocation, LineObserver, RunOutput};
pub use io::{ImageInput, ImageOutput, InputKind, MaterializedInput, MaterializedMatrix, MatrixInput};
pub use log::{BufferLogSink, LogSink, NoOpLogSink, TracingLogSink};

use crate::config::WorkspaceConfig;
use crate::errors::{BasilError, Result};
use crate::image::SandboxImage;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

enum WaitOutcome {
    Exited(ExitStatus),
    Cancelled(String),
    TimedOut(f64),
}

/// A directory in which external programs are run.
///
/// Temporary workspaces delete their directory when dropped; workspaces
/// opened on a caller-supplied directory leave it in place.
pub struct Workspace {
    dir: PathBuf,
    temp: Option<TempDir>,
    config: WorkspaceConfig,
    search_path: Vec<PathBuf>,
    log: Arc<dyn LogSink>,
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace")
            .field("dir", &self.dir)
            .field("temporary", &self.temp.is_some())
            .field("search_path", &self.search_path)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}

impl Workspace {
    /// Creates a workspace in a fresh temporary directory.
    pub fn temporary(config: WorkspaceConfig) -> Result<Self> {
        let temp = tempfile::Builder::new().prefix("fsl").tempdir()?;
        let dir = temp.path().to_path_buf();
        debug!(dir = %dir.display(), "Created temporary workspace");
        Ok(Self::with_dir(dir, Some(temp), config))
    }

    /// Opens a workspace on `dir`, creating it if needed.
    pub fn at(dir: impl AsRef<Path>, config: WorkspaceConfig) -> Result<Self> {
        let dir = dir.as_ref();
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(dir)
        };
        std::fs::create_dir_all(&dir)?;
        Ok(Self::with_dir(dir, None, config))
    }

    fn with_dir(dir: PathBuf, temp: Option<TempDir>, config: WorkspaceConfig) -> Self {
        let search_path = config.resolved_search_path();
        Self {
            dir,
            temp,
            config,
            search_path,
            log: Arc::new(TracingLogSink),
        }
    }

    /// Sends program output to `sink`.
    #[must_use]
    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log = sink;
        self
    }

    /// The working directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True if the directory is removed on drop.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.temp.is_some()
    }

    /// The configuration this workspace was created with.
    #[must_use]
    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    /// The log sink.
    #[must_use]
    pub fn log_sink(&self) -> &Arc<dyn LogSink> {
        &self.log
    }

    /// The program search path.
    #[must_use]
    pub fn search_path(&self) -> &[PathBuf] {
        &self.search_path
    }

    /// Extension used for images written into this workspace.
    #[must_use]
    pub fn output_ext(&self) -> &'static str {
        self.config.output_type.extension()
    }

    /// Removes a temporary directory now, reporting any failure.
    pub fn close(self) -> Result<()> {
        if let Some(temp) = self.temp {
            temp.close()?;
        }
        Ok(())
    }

    /// Creates a child workspace in a subdirectory and copies `imgs` into it.
    ///
    /// The child shares this workspace's configuration and log sink.
    pub fn sub(&self, name: &str, imgs: Vec<SandboxImage>) -> Result<Self> {
        let child = Self::at(self.dir.join(name), self.config.clone())?.with_log_sink(self.log.clone());
        for mut img in imgs {
            child.add_img(&mut img)?;
        }
        Ok(child)
    }

    /// Saves an image into the workspace; the image then refers to the saved file.
    pub fn add_img(&self, img: &mut SandboxImage) -> Result<PathBuf> {
        Ok(img.save(&self.dir, self.output_ext())?)
    }

    /// Copies a file into the workspace, optionally renaming it.
    pub fn add_file(&self, path: impl AsRef<Path>, name: Option<&str>) -> Result<PathBuf> {
        let path = path.as_ref();
        let target = match name {
            Some(name) => self.dir.join(name),
            None => self.dir.join(path.file_name().ok_or_else(|| {
                BasilError::Internal(format!("{} has no file name", path.display()))
            })?),
        };
        std::fs::copy(path, &target)?;
        Ok(target)
    }

    /// Writes a text file into the workspace.
    pub fn add_text(&self, text: &str, name: &str) -> Result<PathBuf> {
        let target = self.dir.join(name);
        std::fs::write(&target, text)?;
        Ok(target)
    }

    /// Deletes an image file. Failure is logged as a warning, not returned.
    pub fn del_img(&self, img: impl Into<ImageInput>) {
        let img = img.into();
        let path = match img {
            ImageInput::Path(ref path) => {
                SandboxImage::from_path_or(self.resolve_image_path(path), self.output_ext()).file_path()
            }
            ImageInput::Image(ref image) => image.file_path(),
            ImageInput::Array(_) => None,
        };

        let removed = path.as_ref().map(std::fs::remove_file);
        if !matches!(removed, Some(Ok(()))) {
            let description = path.map_or_else(|| "in-memory data".to_string(), |p| p.display().to_string());
            warn!(path = %description, "Failed to delete image");
            self.log.write_line(&format!("WARNING: failed to delete {description}"));
        }
    }

    /// Locates `program` on the search path.
    ///
    /// Names containing a path separator are used as given. Otherwise the
    /// first executable file found wins, falling back to the bare name so the
    /// system `PATH` applies.
    #[must_use]
    pub fn find_program(&self, program: &str) -> PathBuf {
        if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
            return PathBuf::from(program);
        }
        self.search_path
            .iter()
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
            .unwrap_or_else(|| PathBuf::from(program))
    }

    /// Runs a program and returns what it produced.
    ///
    /// With `expected` patterns only matching files are returned; otherwise
    /// every new or modified file is.
    pub fn run(&self, program: &str, args: impl Into<CommandArgs>, expected: &[&str]) -> Result<RunOutput> {
        self.execute(
            Invocation::new(program)
                .args(args)
                .expected(expected.iter().copied()),
        )
    }

    /// Runs a fully described invocation.
    pub fn execute(&self, inv: Invocation) -> Result<RunOutput> {
        let argv = inv.args.to_argv()?;
        let exe = self.find_program(&inv.program);
        let command_line = std::iter::once(exe.display().to_string())
            .chain(argv.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        let expected = snapshot::compile_expected(&inv.expected)?;

        if let Some(ref token) = inv.cancel {
            token.check()?;
        }
        if self.config.echo {
            self.log.write_line(&command_line);
        }
        debug!(program = %inv.program, command = %command_line, "Running external program");

        let pre = snapshot::snapshot(&self.dir)?;

        let (reader, writer) = std::io::pipe()?;
        let mut command = Command::new(&exe);
        command
            .args(&argv)
            .current_dir(&self.dir)
            .env("FSLOUTPUTTYPE", self.config.output_type.env_value())
            .stdin(Stdio::null())
            .stdout(writer.try_clone()?)
            .stderr(writer);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let spawned = command.spawn();
        // The command holds the write end; the pump only sees EOF once it is gone.
        drop(command);
        let mut child = spawned.map_err(|e| BasilError::Invocation {
            program: inv.program.clone(),
            command: command_line.clone(),
            exit_code: None,
            output: e.to_string(),
        })?;

        let captured = Mutex::new(String::new());
        let observer = inv.observer.as_deref();

        let outcome = std::thread::scope(|scope| {
            scope.spawn(|| self.pump(reader, &captured, observer));
            self.wait_for(&mut child, &inv)
        })?;
        let output = captured.into_inner();

        let status = match outcome {
            WaitOutcome::Exited(status) => status,
            WaitOutcome::Cancelled(reason) => {
                info!(program = %inv.program, reason = %reason, "External program cancelled");
                return Err(BasilError::Cancelled(reason));
            }
            WaitOutcome::TimedOut(seconds) => {
                warn!(program = %inv.program, seconds, "External program timed out");
                return Err(BasilError::Timeout {
                    program: inv.program,
                    seconds,
                });
            }
        };

        if !status.success() {
            return Err(BasilError::Invocation {
                program: inv.program,
                command: command_line,
                exit_code: status.code(),
                output,
            });
        }

        let post = snapshot::snapshot(&self.dir)?;
        let files = snapshot::select_return_files(&pre, &post, &expected);
        if self.config.debug {
            debug!(files = ?files, "Files returned");
        }
        let (images, text) = self.classify(&files)?;

        Ok(RunOutput {
            images,
            text,
            exit_code: status.code().unwrap_or_default(),
            output,
            command: command_line,
        })
    }

    fn pump<R: Read>(&self, reader: R, captured: &Mutex<String>, observer: Option<&(dyn Fn(&str) + Send + Sync)>) {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf);
                    let line = text.trim_end_matches(|c: char| c == '\n' || c == '\r');
                    self.log.write_line(line);
                    {
                        let mut captured = captured.lock();
                        captured.push_str(line);
                        captured.push('\n');
                    }
                    if let Some(observer) = observer {
                        observer(line);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed reading program output");
                    break;
                }
            }
        }
    }

    fn wait_for(&self, child: &mut Child, inv: &Invocation) -> Result<WaitOutcome> {
        let started = Instant::now();
        let timeout = inv.timeout.or(self.config.timeout_seconds);
        let poll = Duration::from_millis(self.config.poll_interval_ms.max(1));

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(WaitOutcome::Exited(status)),
                Ok(None) => {}
                Err(e) => {
                    kill(child);
                    return Err(e.into());
                }
            }

            if let Some(ref token) = inv.cancel {
                if token.is_cancelled() {
                    kill(child);
                    return Ok(WaitOutcome::Cancelled(
                        token.reason().unwrap_or_else(|| "cancelled".to_string()),
                    ));
                }
            }

            if let Some(seconds) = timeout {
                if started.elapsed().as_secs_f64() >= seconds {
                    kill(child);
                    return Ok(WaitOutcome::TimedOut(seconds));
                }
            }

            std::thread::sleep(poll);
        }
    }

    fn classify(&self, files: &[PathBuf]) -> Result<(Vec<SandboxImage>, BTreeMap<String, String>)> {
        let mut images = Vec::new();
        let mut text = BTreeMap::new();

        for relative in files {
            let path = self.dir.join(relative);
            match SandboxImage::open(&path) {
                Ok(image) => images.push(image),
                Err(image_err) => match std::fs::read_to_string(&path) {
                    Ok(contents) => {
                        let key = relative
                            .file_name()
                            .map_or_else(|| relative.display().to_string(), |n| n.to_string_lossy().into_owned());
                        text.insert(key, contents);
                    }
                    Err(text_err) => {
                        self.log
                            .write_line(&format!("WARNING: Could not handle output file {}", relative.display()));
                        return Err(BasilError::output_recovery(
                            path,
                            format!("not an image ({image_err}) and not text ({text_err})"),
                        ));
                    }
                },
            }
        }
        Ok((images, text))
    }

    pub(crate) fn resolve_image_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.dir.join(path)
        }
    }
}

/// Kills the child and, on unix, every process in its group.
fn kill(child: &mut Child) {
    #[cfg(unix)]
    kill_group(child.id());
    if let Err(e) = child.kill() {
        debug!(error = %e, "Kill failed; child probably exited");
    }
    if let Err(e) = child.wait() {
        debug!(error = %e, "Wait after kill failed");
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let signalled = Command::new("kill")
        .args(["-s", "KILL", "--", &format!("-{pgid}")])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match signalled {
        Ok(status) if status.success() => {}
        Ok(status) => debug!(pgid, status = %status, "Process group kill reported failure"),
        Err(e) => debug!(pgid, error = %e, "Could not signal process group"),
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::image::VoxelArray;
    use pretty_assertions::assert_eq;

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        crate::testing::fake_program(dir, name, body).unwrap()
    }

    fn config_for(bin: &Path) -> WorkspaceConfig {
        WorkspaceConfig::new().with_search_path([bin]).with_poll_interval_ms(5)
    }

    #[test]
    fn test_temporary_workspace_removed_on_drop() {
        let ws = Workspace::temporary(WorkspaceConfig::new()).unwrap();
        let dir = ws.dir().to_path_buf();
        assert!(dir.is_dir());
        assert!(ws.is_temporary());

        drop(ws);
        assert!(!dir.exists());
    }

    #[test]
    fn test_caller_directory_preserved() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::at(root.path().join("work"), WorkspaceConfig::new()).unwrap();
        ws.add_text("hello", "note.txt").unwrap();
        ws.close().unwrap();

        assert!(root.path().join("work").join("note.txt").is_file());
    }

    #[test]
    fn test_add_img_and_sub_workspace() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(BufferLogSink::new());
        let ws = Workspace::at(root.path(), WorkspaceConfig::new())
            .unwrap()
            .with_log_sink(sink.clone());

        let mut img = SandboxImage::from_array("mask", VoxelArray::filled(vec![2, 2, 1], 1.0).unwrap());
        let path = ws.add_img(&mut img).unwrap();
        assert_eq!(path, root.path().join("mask.nii.gz"));

        let sub = ws.sub("step1", vec![img]).unwrap();
        assert!(root.path().join("step1").join("mask.nii.gz").is_file());
        sub.log_sink().write_line("shared");
        assert_eq!(sink.contents(), "shared\n");
    }

    #[test]
    fn test_del_img_warns_instead_of_failing() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(BufferLogSink::new());
        let ws = Workspace::at(root.path(), WorkspaceConfig::new())
            .unwrap()
            .with_log_sink(sink.clone());

        ws.add_text("x", "gone.nii").unwrap();
        ws.del_img("gone.nii");
        assert!(!root.path().join("gone.nii").exists());
        assert!(sink.contents().is_empty());

        ws.del_img("gone.nii");
        assert!(sink.contents().starts_with("WARNING: failed to delete"));
    }

    #[test]
    fn test_find_program_falls_back_to_bare_name() {
        let ws = Workspace::temporary(WorkspaceConfig::new().with_search_path(Vec::<PathBuf>::new())).unwrap();
        assert_eq!(ws.find_program("bet"), PathBuf::from("bet"));
        assert_eq!(ws.find_program("/usr/bin/env"), PathBuf::from("/usr/bin/env"));
    }

    #[cfg(unix)]
    #[test]
    fn test_find_program_requires_executable() {
        let bin = tempfile::tempdir().unwrap();
        std::fs::write(bin.path().join("flirt"), "not executable").unwrap();
        let script = write_script(bin.path(), "bet", "exit 0");

        let ws = Workspace::temporary(config_for(bin.path())).unwrap();
        assert_eq!(ws.find_program("bet"), script);
        assert_eq!(ws.find_program("flirt"), PathBuf::from("flirt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_captures_output_and_new_files() {
        let bin = tempfile::tempdir().unwrap();
        write_script(
            bin.path(),
            "maketext",
            "echo \"making $1\"\necho oops >&2\necho \"$FSLOUTPUTTYPE\" > \"$1.txt\"",
        );

        let sink = Arc::new(BufferLogSink::new());
        let ws = Workspace::temporary(config_for(bin.path()).with_echo(true))
            .unwrap()
            .with_log_sink(sink.clone());
        ws.add_text("old", "existing.txt").unwrap();

        let out = ws.run("maketext", "result", &[]).unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.images.is_empty());
        assert_eq!(out.text.keys().collect::<Vec<_>>(), vec!["result.txt"]);
        assert_eq!(out.text["result.txt"], "NIFTI_GZ\n");
        assert!(out.output.contains("making result"));
        assert!(out.output.contains("oops"));

        let log = sink.contents();
        assert!(log.starts_with(&format!("{} result", bin.path().join("maketext").display())));
        assert!(log.contains("oops"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_expected_patterns_and_images() {
        let bin = tempfile::tempdir().unwrap();
        write_script(bin.path(), "copyimg", "mkdir -p out\ncp \"$1\" out/copy.nii\necho log > out/logfile");

        let ws = Workspace::temporary(config_for(bin.path())).unwrap();
        let mut src = SandboxImage::from_array("src.nii", VoxelArray::filled(vec![2, 1, 1], 3.0).unwrap());
        let src_path = ws.add_img(&mut src).unwrap();

        let out = ws
            .run("copyimg", src_path.display().to_string(), &["out/"])
            .unwrap();
        assert_eq!(out.images.len(), 1);
        assert_eq!(out.image("copy").unwrap().to_array().unwrap().values(), &[3.0, 3.0]);
        assert_eq!(out.text["logfile"], "log\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_is_invocation_error() {
        let bin = tempfile::tempdir().unwrap();
        write_script(bin.path(), "fail", "echo 'bad input'\nexit 3");

        let ws = Workspace::temporary(config_for(bin.path())).unwrap();
        let err = ws.run("fail", "", &[]).unwrap_err();
        match err {
            BasilError::Invocation {
                exit_code, output, ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(output, "bad input\n");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_binary_output_is_recovery_error() {
        let bin = tempfile::tempdir().unwrap();
        write_script(bin.path(), "binary", "printf '\\377\\376\\000' > junk.bin");

        let ws = Workspace::temporary(config_for(bin.path())).unwrap();
        let err = ws.run("binary", "", &[]).unwrap_err();
        assert!(matches!(err, BasilError::OutputRecovery { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_cancellation_kills_program() {
        let bin = tempfile::tempdir().unwrap();
        write_script(bin.path(), "slow", "echo started\nexec sleep 30");

        let ws = Workspace::temporary(config_for(bin.path())).unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        let inv = Invocation::new("slow")
            .with_cancellation(token)
            .with_observer(move |line| {
                if line == "started" {
                    trigger.cancel("user request");
                }
            });

        let started = Instant::now();
        let err = ws.execute(inv).unwrap_err();
        assert!(err.is_cancellation());
        assert!(started.elapsed() < Duration::from_secs(20));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_wrapper_children() {
        let bin = tempfile::tempdir().unwrap();
        write_script(bin.path(), "wrapped", "echo started\nsleep 6\necho done");

        let ws = Workspace::temporary(config_for(bin.path()).with_timeout(0.2)).unwrap();
        let started = Instant::now();
        let err = ws.run("wrapped", "", &[]).unwrap_err();
        assert!(matches!(err, BasilError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn test_cancellation_kills_wrapper_children() {
        let bin = tempfile::tempdir().unwrap();
        write_script(bin.path(), "wrapped", "echo started\nsleep 6\necho done");

        let ws = Workspace::temporary(config_for(bin.path())).unwrap();
        let token = CancellationToken::new();
        let trigger = token.clone();
        let inv = Invocation::new("wrapped")
            .with_cancellation(token)
            .with_observer(move |line| {
                if line == "started" {
                    trigger.cancel("user request");
                }
            });

        let started = Instant::now();
        let err = ws.execute(inv).unwrap_err();
        assert!(err.is_cancellation());
        assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn test_stderr_interleaves_with_stdout() {
        let bin = tempfile::tempdir().unwrap();
        write_script(bin.path(), "chatty", "echo one\necho two >&2\necho three\necho four >&2");

        let ws = Workspace::temporary(config_for(bin.path())).unwrap();
        let out = ws.run("chatty", "", &[]).unwrap();
        assert_eq!(out.output, "one\ntwo\nthree\nfour\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_program() {
        let bin = tempfile::tempdir().unwrap();
        write_script(bin.path(), "hang", "exec sleep 30");

        let ws = Workspace::temporary(config_for(bin.path()).with_timeout(0.2)).unwrap();
        let err = ws.run("hang", "", &[]).unwrap_err();
        assert!(matches!(err, BasilError::Timeout { .. }));
    }

    #[test]
    fn test_cancelled_before_start() {
        let ws = Workspace::temporary(WorkspaceConfig::new()).unwrap();
        let token = CancellationToken::new();
        token.cancel("early");

        let err = ws
            .execute(Invocation::new("definitely-not-a-program").with_cancellation(token))
            .unwrap_err();
        assert!(err.is_cancellation());
    }
}
