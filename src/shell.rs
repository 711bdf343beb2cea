//! External command execution
//!
//! All changer, drive, snapshot and archive commands go through
//! [`CommandRunner`]. stdout is returned as cleaned lines; stderr is either
//! classified as benign or recorded in the run's [`DiagnosticLog`].

use crate::error::{Result, TapeBackupError};
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured result of one external command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub command: String,
    /// Trimmed stdout lines without blanks, `.` and `..`
    pub lines: Vec<String>,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Diagnostic text for a failure: stderr if any, otherwise the exit code
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit code {}", self.exit_code)
        } else {
            stderr.to_string()
        }
    }
}

/// Run-scoped sink for non-fatal stderr output. Cheap to clone; every clone
/// appends to the same list.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: Into<String>>(&self, message: T) {
        self.entries.lock().push(message.into());
    }

    /// Take everything recorded so far
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Split raw stdout into the lines callers care about
pub fn parse_lines(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !matches!(*line, "" | "." | ".."))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone)]
pub struct CommandRunner {
    benign_stderr: Vec<String>,
    diagnostics: DiagnosticLog,
}

impl CommandRunner {
    pub fn new(benign_stderr: Vec<String>, diagnostics: DiagnosticLog) -> Self {
        Self {
            benign_stderr,
            diagnostics,
        }
    }

    /// Empty stderr, or stderr containing one of the configured fragments
    pub fn is_benign(&self, stderr: &str) -> bool {
        let stderr = stderr.trim();
        stderr.is_empty()
            || self
                .benign_stderr
                .iter()
                .any(|pattern| stderr.contains(pattern.as_str()))
    }

    /// Run a command and return its output whatever the exit code.
    /// Only a failure to spawn is an error.
    pub async fn run<S: AsRef<str>>(&self, program: &str, args: &[S]) -> Result<CommandOutput> {
        self.execute(program, args, None).await
    }

    /// Like [`run`](Self::run) but feeds `input` to the child's stdin
    pub async fn run_with_input<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
        input: &str,
    ) -> Result<CommandOutput> {
        self.execute(program, args, Some(input)).await
    }

    /// Run a command that must succeed. A non-zero exit becomes
    /// `HardwareCommandFailed`; non-benign stderr on success is recorded.
    pub async fn run_checked<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
    ) -> Result<CommandOutput> {
        let output = self.run(program, args).await?;
        if !output.success() {
            return Err(TapeBackupError::hardware(
                output.command.clone(),
                output.diagnostic(),
            ));
        }
        Ok(output)
    }

    async fn execute<S: AsRef<str>>(
        &self,
        program: &str,
        args: &[S],
        input: Option<&str>,
    ) -> Result<CommandOutput> {
        let command = render_command(program, args);
        debug!("Shell command: '{}'", command);

        let mut cmd = Command::new(program);
        cmd.args(args.iter().map(|a| a.as_ref()))
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            TapeBackupError::hardware(command.clone(), format!("failed to spawn: {}", e))
        })?;

        if let (Some(data), Some(mut stdin)) = (input, child.stdin.take()) {
            // the child may exit without reading its input
            if let Err(e) = stdin.write_all(data.as_bytes()).await {
                debug!("stdin of '{}' closed early: {}", command, e);
            }
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        let result = CommandOutput {
            command,
            lines: parse_lines(&stdout),
            stderr,
            exit_code: output.status.code().unwrap_or(-1),
        };
        debug!(
            "Shell output: {:?} (exit code {})",
            result.lines, result.exit_code
        );

        if !self.is_benign(&result.stderr) {
            warn!(
                "Got error while executing command '{}': '{}'",
                result.command, result.stderr
            );
            if result.success() {
                self.diagnostics
                    .push(format!("{}: {}", result.command, result.stderr));
            }
        }

        Ok(result)
    }
}

fn render_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    let mut rendered = program.to_string();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(arg.as_ref());
    }
    rendered
}
