//! Subprocess tool adapter.
//!
//! Spawns the configured command, writes the `StageRequest` as JSON to its
//! stdin and parses the normalized report from stdout. Stdout may carry a
//! full `ToolResult` (tagged with `"kind"`) or the bare report for the
//! adapter's category. A non-zero exit status is an execution error. The
//! scheduler enforces the stage timeout; the child is killed when the
//! future is dropped.

use std::process::Stdio;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::core::pipeline::StageKind;
use crate::domain::ToolResult;

use super::StageRequest;

/// Tool implemented by an external command
#[derive(Debug, Clone)]
pub struct CommandAdapter {
    name: String,
    program: String,
    args: Vec<String>,
    category: StageKind,
}

impl CommandAdapter {
    pub fn new(name: impl Into<String>, program: impl Into<String>, category: StageKind) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            category,
        }
    }

    /// Build from a shell-like command line (whitespace separated, no quoting)
    pub fn from_command_line(name: impl Into<String>, command: &str, category: StageKind) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .context("Tool command must not be empty")?;
        Ok(Self {
            name: name.into(),
            program,
            args: parts.collect(),
            category,
        })
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn category(&self) -> StageKind {
        self.category
    }

    /// Run the command for one stage attempt
    pub async fn run(&self, request: &StageRequest) -> Result<ToolResult> {
        let input = serde_json::to_vec(request).context("Failed to encode stage request")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn tool '{}' ({})", self.name, self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .with_context(|| format!("Failed to write request to tool '{}'", self.name))?;
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for tool '{}'", self.name))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Tool '{}' failed with exit code {}: {}",
                self.name,
                exit_code,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8(output.stdout)
            .with_context(|| format!("Tool '{}' output is not valid UTF-8", self.name))?;
        debug!(tool = %self.name, stage = %request.stage, bytes = stdout.len(), "Tool finished");

        parse_output(self.category, &stdout)
            .with_context(|| format!("Tool '{}' returned an unreadable report", self.name))
    }
}

/// Parse tool stdout into a `ToolResult`
pub fn parse_output(category: StageKind, stdout: &str) -> Result<ToolResult> {
    let value: Value = serde_json::from_str(stdout.trim()).context("Output is not JSON")?;

    if value.get("kind").is_some() {
        return serde_json::from_value(value).context("Output does not match any result kind");
    }

    let result = match category {
        StageKind::Scan => ToolResult::Scan(serde_json::from_value(value)?),
        StageKind::Compliance => ToolResult::Compliance(serde_json::from_value(value)?),
        StageKind::Build => ToolResult::Build(serde_json::from_value(value)?),
        StageKind::Deploy => ToolResult::Deploy(serde_json::from_value(value)?),
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_report_uses_category() {
        let result = parse_output(StageKind::Scan, r#"{"critical": 1, "high": 2}"#).unwrap();
        match result {
            ToolResult::Scan(report) => {
                assert_eq!(report.critical, 1);
                assert_eq!(report.high, 2);
            }
            other => panic!("expected scan result, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tagged_result_wins() {
        let result = parse_output(StageKind::Scan, r#"{"kind": "build", "success": true}"#).unwrap();
        assert!(matches!(result, ToolResult::Build(_)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_output(StageKind::Deploy, "not json").is_err());
    }

    #[test]
    fn test_command_line_split() {
        let adapter =
            CommandAdapter::from_command_line("semgrep", "semgrep-wrapper --json", StageKind::Scan).unwrap();
        assert_eq!(adapter.program(), "semgrep-wrapper");
        assert_eq!(adapter.args, vec!["--json"]);
        assert!(CommandAdapter::from_command_line("x", "  ", StageKind::Scan).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reads_stdout_report() {
        let adapter = CommandAdapter::new("echo", "sh", StageKind::Compliance)
            .with_args(["-c", "cat >/dev/null; echo '{\"compliant\": true}'"]);
        let request = StageRequest {
            change_id: uuid::Uuid::new_v4(),
            revision: "abc".to_string(),
            stage: "stig".to_string(),
            tool: "echo".to_string(),
            kind: StageKind::Compliance,
            attempt: 1,
        };

        let result = adapter.run(&request).await.unwrap();
        assert!(matches!(result, ToolResult::Compliance(r) if r.compliant));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let adapter = CommandAdapter::new("fail", "sh", StageKind::Build).with_args(["-c", "exit 3"]);
        let request = StageRequest {
            change_id: uuid::Uuid::new_v4(),
            revision: "abc".to_string(),
            stage: "build".to_string(),
            tool: "fail".to_string(),
            kind: StageKind::Build,
            attempt: 1,
        };

        let err = adapter.run(&request).await.unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
    }
}
