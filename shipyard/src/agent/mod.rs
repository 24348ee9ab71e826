//! Agent collaborator interface.
//!
//! Both invocation strategies (marker on stdout, structured event stream) and
//! the in-process mock sit behind [`Agent`], so phases see one result type with
//! a reason code instead of strategy-specific errors.

pub mod mock;
pub mod process;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::states::Phase;
use crate::io::config::{AgentConfig, AgentKind};

pub use mock::MockAgent;
pub use process::ProcessAgent;

/// Prefix of a structured tool call on a stdout line (marker mode).
pub const TOOL_CALL_PREFIX: &str = "@shipyard ";

/// Why an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    SignalFound,
    StreamEnded,
    TimedOut,
    ExitedNonZero,
    MissingSignal,
    Interrupted,
}

impl CompletionReason {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            CompletionReason::SignalFound | CompletionReason::StreamEnded
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CompletionReason::SignalFound => "signal_found",
            CompletionReason::StreamEnded => "stream_ended",
            CompletionReason::TimedOut => "timed_out",
            CompletionReason::ExitedNonZero => "exited_non_zero",
            CompletionReason::MissingSignal => "missing_signal",
            CompletionReason::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for CompletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured operation requested by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone)]
pub struct AgentResult {
    pub reason: CompletionReason,
    pub exit_code: Option<i32>,
    pub tool_calls: Vec<ToolCall>,
    /// Tool-call lines that could not be parsed.
    pub malformed_calls: Vec<String>,
    /// Captured stdout (bounded).
    pub output: String,
}

impl AgentResult {
    pub fn new(reason: CompletionReason) -> Self {
        Self {
            reason,
            exit_code: None,
            tool_calls: Vec::new(),
            malformed_calls: Vec::new(),
            output: String::new(),
        }
    }
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub item_id: String,
    pub phase: Phase,
    pub prompt: String,
    pub allowed_tools: Vec<String>,
    /// Repository root on the host.
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    pub research_path: PathBuf,
    pub plan_path: PathBuf,
    pub branch_name: String,
    /// Story being implemented, for implementation iterations.
    pub story_id: Option<String>,
}

/// Builds the command that runs an agent program somewhere (host or VM).
pub trait Launcher: Send + Sync {
    fn command(&self, program: &str, args: &[String], workdir: &Path) -> Command;
}

/// Runs the program directly on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostLauncher;

impl Launcher for HostLauncher {
    fn command(&self, program: &str, args: &[String], workdir: &Path) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(workdir);
        cmd
    }
}

pub trait Agent: Send + Sync {
    fn name(&self) -> &'static str;

    fn invoke(
        &self,
        request: &AgentRequest,
        launcher: &dyn Launcher,
        cancel: &AtomicBool,
    ) -> Result<AgentResult>;
}

/// Agent selected by `[agent]` configuration.
pub fn agent_from_config(config: &AgentConfig) -> Arc<dyn Agent> {
    match config.kind {
        AgentKind::Process => Arc::new(ProcessAgent::new(config.clone(), false)),
        AgentKind::EventStream => Arc::new(ProcessAgent::new(config.clone(), true)),
        AgentKind::Mock => Arc::new(MockAgent::new(config.completion_signal.clone())),
    }
}

/// Parse `@shipyard {json}` lines out of plain stdout.
pub fn parse_marker_calls(stdout: &str) -> (Vec<ToolCall>, Vec<String>) {
    let mut calls = Vec::new();
    let mut malformed = Vec::new();
    for line in stdout.lines() {
        let Some(payload) = line.trim_start().strip_prefix(TOOL_CALL_PREFIX) else {
            continue;
        };
        match serde_json::from_str::<ToolCall>(payload.trim()) {
            Ok(call) => calls.push(call),
            Err(err) => malformed.push(format!("{}: {err}", payload.trim())),
        }
    }
    (calls, malformed)
}

/// Events of interest in a JSON-lines agent stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ToolCall {
        name: String,
        #[serde(default)]
        input: Value,
    },
    Result {
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Default, PartialEq)]
pub struct StreamSummary {
    pub tool_calls: Vec<ToolCall>,
    pub malformed: Vec<String>,
    /// `Some(is_error)` once a result event was seen.
    pub result: Option<bool>,
}

/// Parse JSON-lines events. Lines that are not JSON objects, or carry unknown
/// event types, are agent chatter and ignored.
pub fn parse_event_stream(stdout: &str) -> StreamSummary {
    let mut summary = StreamSummary::default();
    for line in stdout.lines().map(str::trim).filter(|l| l.starts_with('{')) {
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let kind = value.get("type").and_then(Value::as_str).unwrap_or("");
        if kind != "tool_call" && kind != "result" {
            continue;
        }
        match serde_json::from_value::<StreamEvent>(value) {
            Ok(StreamEvent::ToolCall { name, input }) => {
                summary.tool_calls.push(ToolCall { name, input });
            }
            Ok(StreamEvent::Result { is_error }) => summary.result = Some(is_error),
            Err(err) => summary.malformed.push(format!("{line}: {err}")),
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn marker_lines_become_tool_calls() {
        let stdout = "thinking\n@shipyard {\"name\":\"save_prd\",\"input\":{\"id\":\"001-a\"}}\n@shipyard {broken\n";
        let (calls, malformed) = parse_marker_calls(stdout);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "save_prd");
        assert_eq!(calls[0].input, json!({"id": "001-a"}));
        assert_eq!(malformed.len(), 1);
    }

    #[test]
    fn event_stream_collects_calls_and_result() {
        let stdout = concat!(
            "{\"type\":\"assistant\",\"text\":\"hi\"}\n",
            "not json\n",
            "{\"type\":\"tool_call\",\"name\":\"update_story_status\",\"input\":{\"story_id\":\"US-001\"}}\n",
            "{\"type\":\"result\",\"is_error\":false}\n",
        );
        let summary = parse_event_stream(stdout);
        assert_eq!(summary.tool_calls.len(), 1);
        assert_eq!(summary.result, Some(false));
        assert!(summary.malformed.is_empty());
    }

    #[test]
    fn tool_call_event_without_name_is_malformed() {
        let summary = parse_event_stream("{\"type\":\"tool_call\",\"input\":{}}\n");
        assert!(summary.tool_calls.is_empty());
        assert_eq!(summary.malformed.len(), 1);
        assert_eq!(summary.result, None);
    }

    #[test]
    fn only_signal_and_stream_end_are_success() {
        assert!(CompletionReason::SignalFound.is_success());
        assert!(CompletionReason::StreamEnded.is_success());
        assert!(!CompletionReason::MissingSignal.is_success());
        assert!(!CompletionReason::TimedOut.is_success());
    }
}
