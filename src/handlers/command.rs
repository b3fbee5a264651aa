//! Handler that runs an external program.
//!
//! The task's JSON arguments are written to the program's stdin. Stdout is
//! parsed as JSON when possible and otherwise returned as a string. A
//! non-zero exit status or a timeout is a handler failure.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{HandlerOutput, TaskHandler};

/// Subprocess-backed task handler
#[derive(Debug, Clone)]
pub struct CommandHandler {
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandHandler {
    /// Create a handler running `program` with a 60 second timeout
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run_process(&self, input: String) -> Result<String> {
        let output = timeout(self.timeout, self.spawn_and_wait(input))
            .await
            .with_context(|| {
                format!("Task '{}' timed out after {:?}", self.name, self.timeout)
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Task '{}' exited with code {}: {}",
                self.name,
                exit_code,
                stderr.trim()
            );
        }

        String::from_utf8(output.stdout).context("Command output is not valid UTF-8")
    }

    /// Stdin is fed from its own task while output is collected and closed
    /// when the write finishes. Dropping this future kills the child.
    async fn spawn_and_wait(&self, input: String) -> Result<std::process::Output> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}' for task '{}'", self.program, self.name))?;

        let writer = child.stdin.take().map(|mut stdin| {
            tokio::spawn(async move {
                // A program that exits without reading its input closes the pipe early
                match stdin.write_all(input.as_bytes()).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                }
            })
        });

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;

        if let Some(writer) = writer {
            writer
                .await
                .context("Stdin writer task panicked")?
                .context("Failed to write task arguments to stdin")?;
        }

        Ok(output)
    }
}

#[async_trait]
impl TaskHandler for CommandHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, args: &Value) -> Result<HandlerOutput> {
        let input = serde_json::to_string(args).context("Failed to serialize task arguments")?;
        let stdout = self.run_process(input).await?;

        let trimmed = stdout.trim();
        let value = serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()));

        Ok(HandlerOutput::new(value).with_tool(format!("exec:{}", self.program)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_json_stdout_is_parsed() {
        let handler = CommandHandler::new("cat", "cat");
        let output = handler.execute(&json!({"site": "a"})).await.unwrap();

        assert_eq!(output.value, json!({"site": "a"}));
        assert_eq!(output.tools, vec!["exec:cat".to_string()]);
    }

    #[tokio::test]
    async fn test_plain_stdout_is_string() {
        let handler = CommandHandler::new("hello", "sh")
            .with_args(vec!["-c".to_string(), "echo hello".to_string()]);
        let output = handler.execute(&json!(null)).await.unwrap();

        assert_eq!(output.value, json!("hello"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let handler = CommandHandler::new("fail", "sh")
            .with_args(vec!["-c".to_string(), "echo broken >&2; exit 3".to_string()]);
        let err = handler.execute(&json!({})).await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("exited with code 3"));
        assert!(message.contains("broken"));
    }

    #[tokio::test]
    async fn test_timeout_fails() {
        let handler = CommandHandler::new("slow", "sleep")
            .with_args(vec!["5".to_string()])
            .with_timeout(Duration::from_millis(50));
        let err = handler.execute(&json!({})).await.unwrap_err();

        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_large_echoed_input_completes() {
        let blob = "x".repeat(1 << 20);
        let handler = CommandHandler::new("cat", "cat").with_timeout(Duration::from_secs(10));
        let output = handler.execute(&json!({ "blob": blob })).await.unwrap();

        assert_eq!(output.value["blob"].as_str().map(str::len), Some(1 << 20));
    }

    #[tokio::test]
    async fn test_timeout_covers_stdin_write() {
        // Never reads stdin, so a large payload blocks the writer
        let handler = CommandHandler::new("stuck", "sleep")
            .with_args(vec!["5".to_string()])
            .with_timeout(Duration::from_millis(300));
        let blob = "x".repeat(1 << 20);

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            handler.execute(&json!({ "blob": blob })),
        )
        .await
        .expect("handler ignored its own timeout");
        assert!(result.unwrap_err().to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let handler = CommandHandler::new("ghost", "/nonexistent/keystone-test-binary");
        assert!(handler.execute(&json!({})).await.is_err());
    }
}
