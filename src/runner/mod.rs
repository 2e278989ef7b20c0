//! Coding-agent subprocess integration. A `Runner` spawns an external CLI,
//! streams its stdout as newline-delimited JSON, and turns that into a
//! `RunResult` plus a live `onStatus` callback. Malformed lines are
//! dropped rather than failing the run — a single corrupted line from a
//! long-running subprocess shouldn't sink the whole task.

use crate::constants::RUNNER_TIMEOUT_SECS;
use crate::error::{DispatchError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum StatusEvent {
    Text { text: String },
    Tool { tool: String, input: String },
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub max_turns: u32,
    pub mcp_config_path: Option<String>,
    pub model: Option<String>,
}

#[async_trait]
pub trait Runner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(
        &self,
        prompt: &str,
        work_dir: &Path,
        opts: &RunOptions,
        cancel: CancellationToken,
        on_status: Box<dyn Fn(StatusEvent) + Send + Sync>,
    ) -> Result<RunResult>;
}

/// Drain stdout as newline-delimited JSON and wait for exit, all under one
/// race against cancellation and the wall-clock timeout. A runner that
/// produces no output while it works (e.g. one long tool call) must still
/// be killable the instant its token fires — sequencing "read to EOF" then
/// "wait with timeout" would leave `next_line().await` uncancellable for
/// as long as the child keeps stdout open, so both the read loop and the
/// final wait share the same `tokio::select!` against `cancel` and the
/// timeout clock, killing the child on whichever fires first.
async fn stream_and_wait(
    mut child: tokio::process::Child,
    parse_line: impl Fn(&str) -> Option<ParsedLine>,
    on_status: &(dyn Fn(StatusEvent) + Send + Sync),
    cancel: CancellationToken,
) -> Result<(bool, String, std::process::ExitStatus)> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| DispatchError::RunnerFail("no stdout on child process".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    let mut last_assistant_text: Option<String> = None;
    let mut terminal_result: Option<(bool, String)> = None;

    let timeout = tokio::time::sleep(std::time::Duration::from_secs(RUNNER_TIMEOUT_SECS));
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.map_err(|e| DispatchError::RunnerFail(format!("reading stdout: {e}")))? {
                    Some(line) => {
                        let Some(parsed) = parse_line(&line) else {
                            continue;
                        };
                        match parsed {
                            ParsedLine::Text(text) => {
                                on_status(StatusEvent::Text { text: text.clone() });
                                last_assistant_text = Some(text);
                            }
                            ParsedLine::Tool { tool, input } => {
                                on_status(StatusEvent::Tool { tool: tool.clone(), input: input.clone() });
                            }
                            ParsedLine::Result { success, output } => {
                                terminal_result = Some((success, output));
                            }
                        }
                    }
                    None => break,
                }
            }
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(DispatchError::RunnerFail("runner cancelled".to_string()));
            }
            _ = &mut timeout => {
                let _ = child.kill().await;
                return Err(DispatchError::RunnerFail(format!(
                    "runner timed out after {RUNNER_TIMEOUT_SECS}s"
                )));
            }
        }
    }

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|e| DispatchError::RunnerFail(format!("waiting for child: {e}")))?
        }
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(DispatchError::RunnerFail("runner cancelled".to_string()));
        }
        _ = &mut timeout => {
            let _ = child.kill().await;
            return Err(DispatchError::RunnerFail(format!(
                "runner timed out after {RUNNER_TIMEOUT_SECS}s"
            )));
        }
    };

    if let Some((success, output)) = terminal_result {
        return Ok((success, output, status));
    }
    if let Some(text) = last_assistant_text {
        return Ok((true, text, status));
    }
    Ok((true, "Task completed (no output)".to_string(), status))
}

enum ParsedLine {
    Text(String),
    Tool { tool: String, input: String },
    Result { success: bool, output: String },
}

/// Drain the child's stderr concurrently with stdout so a chatty process
/// can't deadlock on a full pipe buffer. Returns the captured text for
/// use in the failure-output fallback.
fn spawn_stderr_capture(
    child: &mut tokio::process::Child,
) -> tokio::task::JoinHandle<String> {
    let stderr = child.stderr.take();
    tokio::spawn(async move {
        let Some(stderr) = stderr else {
            return String::new();
        };
        let mut lines = BufReader::new(stderr).lines();
        let mut buf = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if !buf.is_empty() {
                buf.push('\n');
            }
            buf.push_str(&line);
        }
        buf
    })
}

#[derive(Deserialize)]
struct ClaudeStreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    input: Option<serde_json::Value>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    success: Option<bool>,
}

fn summarize_input(input: &serde_json::Value) -> String {
    if let Some(path) = input.get("file_path").and_then(|v| v.as_str()) {
        return path.to_string();
    }
    if let Some(command) = input.get("command").and_then(|v| v.as_str()) {
        return command.to_string();
    }
    if let Some(pattern) = input.get("pattern").and_then(|v| v.as_str()) {
        return pattern.to_string();
    }
    let s = input.to_string();
    if s.len() > 200 {
        format!("{}...", &s[..200])
    } else {
        s
    }
}

fn parse_claude_line(line: &str) -> Option<ParsedLine> {
    let event: ClaudeStreamEvent = serde_json::from_str(line).ok()?;
    match event.event_type.as_str() {
        "text" => event.text.map(ParsedLine::Text),
        "tool_use" | "tool" => Some(ParsedLine::Tool {
            tool: event.tool.unwrap_or_else(|| "unknown".to_string()),
            input: event
                .input
                .as_ref()
                .map(summarize_input)
                .unwrap_or_default(),
        }),
        "result" => Some(ParsedLine::Result {
            success: event.success.unwrap_or(true),
            output: event.result.unwrap_or_default(),
        }),
        _ => None,
    }
}

pub struct ClaudeCodeRunner {
    binary_path: String,
}

impl ClaudeCodeRunner {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

#[async_trait]
impl Runner for ClaudeCodeRunner {
    fn name(&self) -> &'static str {
        "claude-code"
    }

    async fn run(
        &self,
        prompt: &str,
        work_dir: &Path,
        opts: &RunOptions,
        cancel: CancellationToken,
        on_status: Box<dyn Fn(StatusEvent) + Send + Sync>,
    ) -> Result<RunResult> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.current_dir(work_dir)
            .arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose")
            .arg("--max-turns")
            .arg(opts.max_turns.to_string())
            .arg("--dangerously-skip-permissions")
            .env("CI", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(mcp_config) = &opts.mcp_config_path {
            cmd.arg("--mcp-config").arg(mcp_config);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| DispatchError::RunnerFail(format!("failed to spawn claude-code: {e}")))?;

        let stderr_handle = spawn_stderr_capture(&mut child);
        let (success, output, status) =
            stream_and_wait(child, parse_claude_line, on_status.as_ref(), cancel).await?;
        let stderr = stderr_handle.await.unwrap_or_default();

        if !status.success() {
            return Ok(RunResult {
                success: false,
                output: if !stderr.trim().is_empty() {
                    stderr
                } else if !output.is_empty() {
                    output
                } else {
                    "claude-code runner failed".to_string()
                },
            });
        }
        Ok(RunResult { success, output })
    }
}

pub struct CodexRunner {
    binary_path: String,
}

impl CodexRunner {
    pub fn new(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }
}

fn parse_codex_line(line: &str) -> Option<ParsedLine> {
    // Codex's JSON event shape reuses the same {type, text/tool/result} idiom.
    parse_claude_line(line)
}

#[async_trait]
impl Runner for CodexRunner {
    fn name(&self) -> &'static str {
        "codex"
    }

    async fn run(
        &self,
        prompt: &str,
        work_dir: &Path,
        opts: &RunOptions,
        cancel: CancellationToken,
        on_status: Box<dyn Fn(StatusEvent) + Send + Sync>,
    ) -> Result<RunResult> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("exec")
            .arg("--json")
            .arg("--dangerously-bypass-approvals-and-sandbox")
            .arg("--skip-git-repo-check")
            .arg("--ephemeral")
            .arg("-C")
            .arg(work_dir)
            .env("CI", "1")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(model) = &opts.model {
            cmd.arg("-m").arg(model);
        }
        cmd.arg(prompt);

        let mut child = cmd
            .spawn()
            .map_err(|e| DispatchError::RunnerFail(format!("failed to spawn codex: {e}")))?;

        let stderr_handle = spawn_stderr_capture(&mut child);
        let (success, output, status) =
            stream_and_wait(child, parse_codex_line, on_status.as_ref(), cancel).await?;
        let stderr = stderr_handle.await.unwrap_or_default();

        if !status.success() {
            return Ok(RunResult {
                success: false,
                output: if !stderr.trim().is_empty() {
                    stderr
                } else if !output.is_empty() {
                    output
                } else {
                    "codex runner failed".to_string()
                },
            });
        }
        Ok(RunResult { success, output })
    }
}

pub fn runner_for(name: &str, claude_binary: &str, codex_binary: &str) -> Result<Box<dyn Runner>> {
    match name {
        "claude-code" => Ok(Box::new(ClaudeCodeRunner::new(claude_binary))),
        "codex" => Ok(Box::new(CodexRunner::new(codex_binary))),
        other => Err(DispatchError::RunnerFail(format!("unknown runner: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_event() {
        let line = r#"{"type": "text", "text": "hello"}"#;
        match parse_claude_line(line) {
            Some(ParsedLine::Text(t)) => assert_eq!(t, "hello"),
            _ => panic!("expected text event"),
        }
    }

    #[test]
    fn parses_tool_event_with_file_path() {
        let line = r#"{"type": "tool_use", "tool": "Read", "input": {"file_path": "src/main.rs"}}"#;
        match parse_claude_line(line) {
            Some(ParsedLine::Tool { tool, input }) => {
                assert_eq!(tool, "Read");
                assert_eq!(input, "src/main.rs");
            }
            _ => panic!("expected tool event"),
        }
    }

    #[test]
    fn malformed_line_is_dropped() {
        assert!(parse_claude_line("not json at all").is_none());
    }

    #[test]
    fn parses_result_event() {
        let line = r#"{"type": "result", "success": true, "result": "done"}"#;
        match parse_claude_line(line) {
            Some(ParsedLine::Result { success, output }) => {
                assert!(success);
                assert_eq!(output, "done");
            }
            _ => panic!("expected result event"),
        }
    }

    #[tokio::test]
    async fn stderr_capture_collects_output_after_exit() {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg("echo line one 1>&2; echo line two 1>&2")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let handle = spawn_stderr_capture(&mut child);
        child.wait().await.unwrap();
        let captured = handle.await.unwrap();
        assert_eq!(captured, "line one\nline two");
    }

    #[tokio::test]
    async fn cancellation_kills_child_that_never_writes_to_stdout() {
        // No output at all while "working" — next_line().await would block
        // forever if it weren't racing the cancellation token.
        let child = Command::new("sh")
            .arg("-c")
            .arg("sleep 60")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });

        let started = std::time::Instant::now();
        let result = stream_and_wait(child, parse_claude_line, &|_| {}, cancel).await;
        assert!(result.is_err());
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }
}
