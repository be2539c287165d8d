//! Scripted tool invoker for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::config::ToolKind;
use crate::tools::{InvokeError, Invocation, ToolInvoker, ToolRun};

/// What a scripted invocation does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedBehavior {
    /// Writes the artifact (and captured stdout) and exits 0.
    Succeed,
    /// Exits with the given status without writing anything.
    ExitWith(i32),
    /// Reports the executable as missing.
    MissingExecutable,
    /// Exits 0 without writing anything.
    SucceedWithoutOutput,
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedCall {
    /// Stage name.
    pub stage: String,
    /// Sample identifier, or the run label.
    pub target: String,
    /// Tool invoked.
    pub tool: ToolKind,
    /// Rendered arguments.
    pub args: Vec<String>,
    /// The artifact the stage expected.
    pub artifact: PathBuf,
}

/// A [`ToolInvoker`] that never spawns processes.
///
/// Behaviour is looked up by `(stage, target)`, then `stage`, then tool;
/// anything unscripted succeeds. Every call is recorded.
#[derive(Debug)]
pub struct ScriptedInvoker {
    rules: Mutex<HashMap<(String, Option<String>), ScriptedBehavior>>,
    tools: Mutex<HashMap<ToolKind, ScriptedBehavior>>,
    delay: Option<Duration>,
    calls: Mutex<Vec<ScriptedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedInvoker {
    /// Creates an invoker where every call succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(HashMap::new()),
            tools: Mutex::new(HashMap::new()),
            delay: None,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Makes every call take at least `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Scripts a stage for one target.
    #[must_use]
    pub fn on(self, stage: &str, target: &str, behavior: ScriptedBehavior) -> Self {
        self.rules
            .lock()
            .insert((stage.to_string(), Some(target.to_string())), behavior);
        self
    }

    /// Scripts a stage for every target.
    #[must_use]
    pub fn on_stage(self, stage: &str, behavior: ScriptedBehavior) -> Self {
        self.rules.lock().insert((stage.to_string(), None), behavior);
        self
    }

    /// Scripts every stage using a tool.
    #[must_use]
    pub fn on_tool(self, tool: ToolKind, behavior: ScriptedBehavior) -> Self {
        self.tools.lock().insert(tool, behavior);
        self
    }

    /// Returns every recorded call, in invocation order.
    #[must_use]
    pub fn calls(&self) -> Vec<ScriptedCall> {
        self.calls.lock().clone()
    }

    /// Returns the number of calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Returns how many times a stage was invoked for a target.
    #[must_use]
    pub fn times_invoked(&self, stage: &str, target: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.stage == stage && c.target == target)
            .count()
    }

    /// Returns the index of the first call matching `(stage, target)`.
    #[must_use]
    pub fn call_index(&self, stage: &str, target: &str) -> Option<usize> {
        self.calls
            .lock()
            .iter()
            .position(|c| c.stage == stage && c.target == target)
    }

    /// Returns the highest number of concurrent calls observed.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Clears recorded calls.
    pub fn reset(&self) {
        self.calls.lock().clear();
        self.max_in_flight.store(0, Ordering::SeqCst);
    }

    fn behavior(&self, invocation: &Invocation) -> ScriptedBehavior {
        let rules = self.rules.lock();
        rules
            .get(&(invocation.stage.clone(), Some(invocation.target.clone())))
            .or_else(|| rules.get(&(invocation.stage.clone(), None)))
            .copied()
            .or_else(|| self.tools.lock().get(&invocation.tool).copied())
            .unwrap_or(ScriptedBehavior::Succeed)
    }
}

/// Writes one pileup-shaped record naming the call, so in-process transforms
/// downstream have a site to read.
fn write_output(path: &Path, invocation: &Invocation) -> Result<(), InvokeError> {
    std::fs::write(
        path,
        format!(
            "{}\t{}\t{}\t1\tA\tI\n",
            invocation.target, invocation.stage, invocation.tool
        ),
    )
    .map_err(|source| InvokeError::Io {
        program: invocation.program.clone(),
        source,
    })
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ToolRun, InvokeError> {
        self.calls.lock().push(ScriptedCall {
            stage: invocation.stage.clone(),
            target: invocation.target.clone(),
            tool: invocation.tool,
            args: invocation.args.clone(),
            artifact: invocation.artifact.clone(),
        });
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result: Result<ToolRun, InvokeError> = async {
            if let Some(delay) = self.delay {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(InvokeError::Cancelled),
                }
            }

            let behavior = self.behavior(invocation);
            let (exit_code, stderr) = match behavior {
                ScriptedBehavior::Succeed => {
                    if let Some(stdout) = &invocation.stdout_to {
                        write_output(stdout, invocation)?;
                    }
                    if !invocation.artifact.exists() {
                        write_output(&invocation.artifact, invocation)?;
                    }
                    (0, String::new())
                }
                ScriptedBehavior::SucceedWithoutOutput => (0, String::new()),
                ScriptedBehavior::ExitWith(code) => {
                    (code, format!("{}: scripted failure\n", invocation.tool))
                }
                ScriptedBehavior::MissingExecutable => {
                    return Err(InvokeError::ExecutableNotFound {
                        program: invocation.program.clone(),
                    })
                }
            };

            Ok(ToolRun {
                exit_code: Some(exit_code),
                stdout: String::new(),
                stderr,
                duration: self.delay.unwrap_or_default(),
            })
        }
        .await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn invocation(dir: &Path, stage: &str, target: &str) -> Invocation {
        Invocation {
            stage: stage.to_string(),
            target: target.to_string(),
            tool: ToolKind::Samtools,
            program: PathBuf::from("/opt/bin/samtools"),
            args: vec!["mpileup".to_string()],
            working_dir: dir.to_path_buf(),
            stdout_to: None,
            artifact: dir.join(format!("{target}.{stage}.out")),
        }
    }

    #[tokio::test]
    async fn test_rule_precedence() {
        let dir = TempDir::new().unwrap();
        let invoker = ScriptedInvoker::new()
            .on_tool(ToolKind::Samtools, ScriptedBehavior::ExitWith(9))
            .on_stage("identity", ScriptedBehavior::ExitWith(2))
            .on("identity", "S1", ScriptedBehavior::MissingExecutable);
        let cancel = CancellationToken::new();

        let s1 = invoker.invoke(&invocation(dir.path(), "identity", "S1"), &cancel).await;
        assert!(matches!(s1, Err(InvokeError::ExecutableNotFound { .. })));

        let s2 = invoker
            .invoke(&invocation(dir.path(), "identity", "S2"), &cancel)
            .await
            .unwrap();
        assert_eq!(s2.exit_code, Some(2));

        let other = invoker
            .invoke(&invocation(dir.path(), "coverage", "S2"), &cancel)
            .await
            .unwrap();
        assert_eq!(other.exit_code, Some(9));
        assert_eq!(invoker.call_count(), 3);
    }

    #[tokio::test]
    async fn test_success_writes_artifact() {
        let dir = TempDir::new().unwrap();
        let invoker = ScriptedInvoker::new();
        let call = invocation(dir.path(), "coverage", "S1");

        let run = invoker.invoke(&call, &CancellationToken::new()).await.unwrap();
        assert!(run.succeeded());
        assert!(call.artifact.exists());
        assert_eq!(invoker.times_invoked("coverage", "S1"), 1);
        assert_eq!(invoker.call_index("coverage", "S1"), Some(0));
    }

    #[tokio::test]
    async fn test_delay_observes_cancellation() {
        let dir = TempDir::new().unwrap();
        let invoker = ScriptedInvoker::new().with_delay(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel("interrupt");

        let result = invoker
            .invoke(&invocation(dir.path(), "coverage", "S1"), &cancel)
            .await;
        assert!(matches!(result, Err(InvokeError::Cancelled)));
        assert!(!dir.path().join("S1.coverage.out").exists());
    }
}
