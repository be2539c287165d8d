//! External tool invocation.

use crate::cancellation::{remove_on_drop, CancellationToken};
use crate::config::ToolKind;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Bytes of stderr (and uncaptured stdout) retained for diagnosis.
pub const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

/// Suffix of the file stdout is written to before it is renamed onto the artifact.
pub const PARTIAL_SUFFIX: &str = "partial";

/// One fully resolved tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Stage name.
    pub stage: String,
    /// Sample identifier, or the run label.
    pub target: String,
    /// Tool being run.
    pub tool: ToolKind,
    /// Executable path.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<String>,
    /// Working directory.
    pub working_dir: PathBuf,
    /// File receiving stdout, if captured.
    pub stdout_to: Option<PathBuf>,
    /// The artifact the stage expects afterwards.
    pub artifact: PathBuf,
}

impl Invocation {
    /// Returns the command line as it would be typed in a shell.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 3);
        parts.push(quote(&self.program.display().to_string()));
        parts.extend(self.args.iter().map(|a| quote(a)));
        if let Some(stdout) = &self.stdout_to {
            parts.push(">".to_string());
            parts.push(quote(&stdout.display().to_string()));
        }
        parts.join(" ")
    }

    /// Returns the SHA-256 fingerprint of the rendered command.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.program.display().to_string().as_bytes());
        for arg in &self.args {
            hasher.update([0u8]);
            hasher.update(arg.as_bytes());
        }
        if let Some(stdout) = &self.stdout_to {
            hasher.update([1u8]);
            hasher.update(stdout.display().to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

fn quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// What happened when a tool ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRun {
    /// Exit code, or `None` if the process died from a signal.
    pub exit_code: Option<i32>,
    /// Tail of stdout when it was not captured to a file.
    pub stdout: String,
    /// Tail of stderr.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
}

impl ToolRun {
    /// Returns true for exit status 0.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Errors preventing a tool from running to completion.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// The executable does not exist or cannot be executed.
    #[error("executable not found: {}", program.display())]
    ExecutableNotFound {
        /// The program path.
        program: PathBuf,
    },

    /// The process could not be started for another reason.
    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        /// The program path.
        program: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Output plumbing failed.
    #[error("I/O error running {}: {source}", program.display())]
    Io {
        /// The program path.
        program: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The run was cancelled and the process was killed.
    #[error("cancelled")]
    Cancelled,
}

/// Runs external tools.
///
/// Implementations block the calling stage until the process exits and never
/// retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Runs one invocation to completion, or until `cancel` fires.
    async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ToolRun, InvokeError>;
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
#[must_use]
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Returns the in-progress path used while capturing stdout to `artifact`.
#[must_use]
pub fn partial_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    artifact.with_file_name(name)
}

/// Spawns real child processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessInvoker;

impl ProcessInvoker {
    /// Creates a process invoker.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut tail = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        tail.extend_from_slice(&buf[..n]);
        if tail.len() > limit {
            let excess = tail.len() - limit;
            tail.drain(..excess);
        }
    }
    Ok(tail)
}

async fn collect_tail(handle: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>) -> String {
    match handle {
        Some(handle) => match handle.await {
            Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to read tool output");
                String::new()
            }
            Err(e) => {
                warn!(error = %e, "Output reader task failed");
                String::new()
            }
        },
        None => String::new(),
    }
}

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ToolRun, InvokeError> {
        let program = invocation.program.clone();
        let io_err = |source| InvokeError::Io {
            program: program.clone(),
            source,
        };

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let partial = invocation.stdout_to.as_deref().map(partial_path);
        let partial_guard = partial.clone().map(remove_on_drop);
        match &partial {
            Some(path) => {
                let file = std::fs::File::create(path).map_err(io_err)?;
                cmd.stdout(Stdio::from(file));
            }
            None => {
                cmd.stdout(Stdio::piped());
            }
        }

        info!(
            stage = %invocation.stage,
            sample = %invocation.target,
            tool = %invocation.tool,
            command = %invocation.command_line(),
            "Invoking tool"
        );

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                InvokeError::ExecutableNotFound {
                    program: program.clone(),
                }
            }
            _ => InvokeError::Spawn {
                program: program.clone(),
                source,
            },
        })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| tokio::spawn(read_tail(out, OUTPUT_TAIL_BYTES)));
        let stderr = child
            .stderr
            .take()
            .map(|err| tokio::spawn(read_tail(err, OUTPUT_TAIL_BYTES)));

        let status = tokio::select! {
            status = child.wait() => status.map_err(io_err)?,
            () = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(stage = %invocation.stage, sample = %invocation.target, error = %e, "Failed to kill tool");
                }
                debug!(stage = %invocation.stage, sample = %invocation.target, "Tool killed on cancellation");
                return Err(InvokeError::Cancelled);
            }
        };

        let run = ToolRun {
            exit_code: status.code(),
            stdout: collect_tail(stdout).await,
            stderr: collect_tail(stderr).await,
            duration: started.elapsed(),
        };

        if run.succeeded() {
            if let (Some(partial), Some(dest)) = (&partial, &invocation.stdout_to) {
                tokio::fs::rename(partial, dest).await.map_err(io_err)?;
            }
            if let Some(guard) = partial_guard {
                guard.disarm();
            }
        }

        debug!(
            stage = %invocation.stage,
            sample = %invocation.target,
            exit_code = ?run.exit_code,
            duration_ms = duration_millis(run.duration),
            "Tool exited"
        );

        Ok(run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn invocation(dir: &Path, program: &str, args: &[&str]) -> Invocation {
        Invocation {
            stage: "alignment".to_string(),
            target: "S1".to_string(),
            tool: ToolKind::Aligner,
            program: PathBuf::from(program),
            args: args.iter().map(ToString::to_string).collect(),
            working_dir: dir.to_path_buf(),
            stdout_to: None,
            artifact: dir.join("S1.aligned.sam"),
        }
    }

    #[test]
    fn test_duration_millis_saturates() {
        assert_eq!(duration_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(duration_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_command_line_quotes() {
        let inv = Invocation {
            args: vec!["mem".to_string(), "@RG\\tID:S1".to_string(), "a b".to_string()],
            stdout_to: Some(PathBuf::from("/r/S1.sam")),
            ..invocation(Path::new("/r"), "/usr/bin/bwa", &[])
        };
        assert_eq!(
            inv.command_line(),
            r"/usr/bin/bwa mem '@RG\tID:S1' 'a b' > /r/S1.sam"
        );
    }

    #[test]
    fn test_fingerprint_is_stable_and_sensitive() {
        let a = invocation(Path::new("/r"), "/usr/bin/bwa", &["mem", "ref.fa"]);
        let b = invocation(Path::new("/elsewhere"), "/usr/bin/bwa", &["mem", "ref.fa"]);
        let c = invocation(Path::new("/r"), "/usr/bin/bwa", &["mem", "ref2.fa"]);

        assert_eq!(a.fingerprint().len(), 64);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/r/S1/BAM/S1.aligned.sam")),
            PathBuf::from("/r/S1/BAM/S1.aligned.sam.partial")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_code_and_stderr() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path(), "sh", &["-c", "echo boom >&2; exit 3"]);
        let run = ProcessInvoker::new()
            .invoke(&inv, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.exit_code, Some(3));
        assert!(!run.succeeded());
        assert_eq!(run.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path(), "/definitely/not/here/bwa", &[]);
        let err = ProcessInvoker::new()
            .invoke(&inv, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::ExecutableNotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_captured_only_on_success() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("out.txt");

        let ok = Invocation {
            stdout_to: Some(dest.clone()),
            ..invocation(dir.path(), "sh", &["-c", "echo hello"])
        };
        let run = ProcessInvoker::new()
            .invoke(&ok, &CancellationToken::new())
            .await
            .unwrap();
        assert!(run.succeeded());
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "hello\n");
        assert!(!partial_path(&dest).exists());

        let failed_dest = dir.path().join("failed.txt");
        let failed = Invocation {
            stdout_to: Some(failed_dest.clone()),
            ..invocation(dir.path(), "sh", &["-c", "echo half; exit 1"])
        };
        let run = ProcessInvoker::new()
            .invoke(&failed, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.exit_code, Some(1));
        assert!(!failed_dest.exists());
        assert!(!partial_path(&failed_dest).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let dir = TempDir::new().unwrap();
        let inv = invocation(dir.path(), "sleep", &["30"]);
        let token = std::sync::Arc::new(CancellationToken::new());

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                token.cancel("interrupt");
            })
        };

        let started = Instant::now();
        let err = ProcessInvoker::new().invoke(&inv, &token).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, InvokeError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
