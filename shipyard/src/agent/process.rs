//! Subprocess agent: prompt on stdin, completion by marker or by a clean end of stream.

use std::fs;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use super::{
    Agent, AgentRequest, AgentResult, CompletionReason, Launcher, parse_event_stream,
    parse_marker_calls,
};
use crate::io::config::AgentConfig;
use crate::io::process::{CommandOutput, WatchOptions, run_watched};

pub struct ProcessAgent {
    config: AgentConfig,
    event_stream: bool,
}

impl ProcessAgent {
    pub fn new(config: AgentConfig, event_stream: bool) -> Self {
        Self {
            config,
            event_stream,
        }
    }
}

impl Agent for ProcessAgent {
    fn name(&self) -> &'static str {
        if self.event_stream {
            "event_stream"
        } else {
            "process"
        }
    }

    #[instrument(skip_all, fields(item = %request.item_id, phase = %request.phase, agent = self.name()))]
    fn invoke(
        &self,
        request: &AgentRequest,
        launcher: &dyn Launcher,
        cancel: &AtomicBool,
    ) -> Result<AgentResult> {
        let mut cmd = launcher.command(&self.config.command, &self.config.args, &request.workdir);
        cmd.env("SHIPYARD_ITEM", &request.item_id)
            .env("SHIPYARD_PHASE", request.phase.as_str())
            .env("SHIPYARD_ALLOWED_TOOLS", request.allowed_tools.join(","));

        let opts = WatchOptions {
            timeout: self.config.timeout(),
            kill_grace: self.config.kill_grace(),
            output_limit_bytes: self.config.output_limit_bytes,
            completion_marker: (!self.event_stream).then_some(self.config.completion_signal.as_str()),
            cancel: Some(cancel),
            stream_path: Some(&request.log_path),
        };
        info!(command = %self.config.command, "invoking agent");
        let output = run_watched(cmd, Some(request.prompt.as_bytes()), opts)
            .with_context(|| format!("run agent {}", self.config.command))?;
        write_agent_log(request, &output)?;

        let stdout = output.stdout_lossy();
        let mut result = if self.event_stream {
            let summary = parse_event_stream(&stdout);
            let mut result = AgentResult::new(classify_stream(&output, summary.result));
            result.tool_calls = summary.tool_calls;
            result.malformed_calls = summary.malformed;
            result
        } else {
            let (calls, malformed) = parse_marker_calls(&stdout);
            let mut result = AgentResult::new(classify_marker(&output));
            result.tool_calls = calls;
            result.malformed_calls = malformed;
            result
        };
        result.exit_code = output.status.code();
        result.output = stdout;
        if !result.reason.is_success() {
            warn!(reason = %result.reason, exit_code = ?result.exit_code, "agent did not complete");
        }
        Ok(result)
    }
}

/// Marker mode: the marker wins over the exit status (we stop the child ourselves after it).
fn classify_marker(output: &CommandOutput) -> CompletionReason {
    if output.interrupted {
        CompletionReason::Interrupted
    } else if output.marker_seen {
        CompletionReason::SignalFound
    } else if output.timed_out {
        CompletionReason::TimedOut
    } else if !output.status.success() {
        CompletionReason::ExitedNonZero
    } else {
        CompletionReason::MissingSignal
    }
}

/// Event-stream mode: success needs a non-error result event and a zero exit.
fn classify_stream(output: &CommandOutput, result_event: Option<bool>) -> CompletionReason {
    if output.interrupted {
        CompletionReason::Interrupted
    } else if output.timed_out {
        CompletionReason::TimedOut
    } else if !output.status.success() || result_event == Some(true) {
        CompletionReason::ExitedNonZero
    } else if result_event == Some(false) {
        CompletionReason::StreamEnded
    } else {
        CompletionReason::MissingSignal
    }
}

fn write_agent_log(request: &AgentRequest, output: &CommandOutput) -> Result<()> {
    if let Some(parent) = request.log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create agent log dir {}", parent.display()))?;
    }
    fs::write(&request.log_path, output.render_log("agent"))
        .with_context(|| format!("write agent log {}", request.log_path.display()))
}
