//! Async runner for ffmpeg and ffprobe invocations.
//!
//! Frame grabs write a single encoded image to stdout, so stdout is kept as
//! raw bytes. Every child is spawned with `kill_on_drop`: when a worker is
//! aborted mid-decode its future is dropped and the process goes with it.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use filmstrip_core::{Error, Result};
use tokio::process::Command;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Lines of stderr kept in error messages.
const STDERR_TAIL_LINES: usize = 4;

/// What a finished tool run produced.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Last few non-empty stderr lines joined with `"; "`.
    ///
    /// ffmpeg prints its banner and stream layout before the actual error,
    /// which always comes last.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self
            .stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
        lines[start..].join("; ")
    }
}

/// One external tool invocation.
///
/// ```no_run
/// use filmstrip_av::ToolCommand;
/// use std::path::PathBuf;
///
/// # async fn example() -> filmstrip_core::Result<()> {
/// let output = ToolCommand::new(PathBuf::from("ffmpeg"))
///     .args(["-ss", "12.5", "-i", "/media/clip.mp4"])
///     .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "-"])
///     .execute()
///     .await?;
/// assert!(!output.stdout.is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl ToolCommand {
    pub fn new(program: PathBuf) -> Self {
        Self {
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Short name used in errors and logs, e.g. `ffmpeg`.
    pub fn tool_name(&self) -> String {
        match self.program.file_stem() {
            Some(stem) => stem.to_string_lossy().into_owned(),
            None => self.program.to_string_lossy().into_owned(),
        }
    }

    /// Run to completion and return the output whatever the exit status.
    ///
    /// Fails only when the process cannot be spawned or waited on, or when
    /// it outlives the timeout (it is killed in that case).
    pub async fn run(&self) -> Result<ToolOutput> {
        let tool = self.tool_name();
        tracing::trace!(tool = %tool, args = ?self.args, "Running tool");

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::tool(&tool, format!("failed to spawn: {e}")))?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::tool(&tool, format!("timed out after {:?}", self.timeout)))?
            .map_err(|e| Error::tool(&tool, format!("failed waiting for exit: {e}")))?;

        Ok(ToolOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Like [`run`](Self::run), but a non-zero exit becomes an
    /// [`Error::Tool`] carrying the tail of stderr.
    pub async fn execute(&self) -> Result<ToolOutput> {
        let output = self.run().await?;
        if !output.success() {
            return Err(Error::tool(
                self.tool_name(),
                format!("exited with {}: {}", output.status, output.stderr_tail()),
            ));
        }
        Ok(output)
    }
}
