//! Shell command executor.

use std::collections::BTreeSet;

use async_trait::async_trait;
use cherry_engine::{ExecutionContext, ExecutionError, Executor};
use tokio::process::Command;
use tracing::debug;

/// Runs the task's `command` context entry through `sh -c`.
///
/// A demonstration executor for the composition root; the real agents live
/// outside this repository and register through the same API.
pub struct ShellExecutor {
    capabilities: BTreeSet<String>,
}

impl ShellExecutor {
    /// Create the executor. Advertises the `shell` capability.
    pub fn new() -> Self {
        Self {
            capabilities: std::iter::once("shell".to_string()).collect(),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    async fn execute(&self, ctx: ExecutionContext) -> Result<String, ExecutionError> {
        let command = ctx
            .task
            .context
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ExecutionError::Unrecoverable("task has no 'command' context entry".into())
            })?;

        debug!(task = %ctx.task.id, command, "running shell command");
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| ExecutionError::Failed(format!("spawn failed: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ExecutionError::Failed(format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim_end(),
            )))
        }
    }
}
