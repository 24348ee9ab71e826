//! Deterministic in-process agent for tests, demos and `--mock-agent`.
//!
//! Produces artifacts that pass the default quality checks: a research
//! document with citations, a plan plus a two-story backlog, and one story
//! completion per implementation iteration.

use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, anyhow};
use serde_json::json;
use tracing::{debug, instrument};

use super::{Agent, AgentRequest, AgentResult, CompletionReason, Launcher, ToolCall};
use crate::backlog::{BACKLOG_SCHEMA_VERSION, Backlog, Story, StoryStatus};
use crate::core::states::{Phase, TOOL_SAVE_PRD, TOOL_UPDATE_STORY_STATUS};

/// Directory (under the repository root) the mock writes its "code" into.
pub const MOCK_OUTPUT_DIR: &str = "mock-output";

pub struct MockAgent {
    completion_signal: String,
}

impl MockAgent {
    pub fn new(completion_signal: impl Into<String>) -> Self {
        Self {
            completion_signal: completion_signal.into(),
        }
    }
}

impl Agent for MockAgent {
    fn name(&self) -> &'static str {
        "mock"
    }

    #[instrument(skip_all, fields(item = %request.item_id, phase = %request.phase))]
    fn invoke(
        &self,
        request: &AgentRequest,
        _launcher: &dyn Launcher,
        _cancel: &AtomicBool,
    ) -> Result<AgentResult> {
        let mut result = AgentResult::new(CompletionReason::SignalFound);
        match request.phase {
            Phase::Research => {
                write_file(&request.research_path, &research_document(&request.item_id))?;
            }
            Phase::Plan => {
                write_file(&request.plan_path, &plan_document(&request.item_id))?;
                let doc = mock_backlog(&request.item_id, &request.branch_name);
                result.tool_calls.push(ToolCall {
                    name: TOOL_SAVE_PRD.to_string(),
                    input: serde_json::to_value(&doc).context("serialize mock backlog")?,
                });
            }
            Phase::Implement => {
                let story_id = request
                    .story_id
                    .as_deref()
                    .ok_or_else(|| anyhow!("mock implement invoked without a story"))?;
                let out = request
                    .workdir
                    .join(MOCK_OUTPUT_DIR)
                    .join(&request.item_id)
                    .join(format!("{story_id}.md"));
                write_file(&out, &format!("# {story_id}\n\nImplemented by the mock agent.\n"))?;
                result.tool_calls.push(ToolCall {
                    name: TOOL_UPDATE_STORY_STATUS.to_string(),
                    input: json!({
                        "story_id": story_id,
                        "status": "done",
                        "notes": "implemented by mock agent",
                    }),
                });
            }
            Phase::Pr | Phase::Complete => {}
        }
        result.exit_code = Some(0);
        result.output = format!("mock {} for {}\n{}\n", request.phase, request.item_id, self.completion_signal);
        write_file(&request.log_path, &result.output)?;
        debug!(calls = result.tool_calls.len(), "mock agent finished");
        Ok(result)
    }
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn research_document(item_id: &str) -> String {
    format!(
        "# Research: {item_id}\n\n\
         ## Summary\n\nThe change touches the entry point and the parser.\n\n\
         ## Findings\n\n\
         - Entry point wiring lives in `src/main.rs:1`.\n\
         - Parsing is handled in `src/parser.rs:10`.\n\
         - Shared types are declared in `src/lib.rs:5`.\n"
    )
}

fn plan_document(item_id: &str) -> String {
    format!(
        "# Plan: {item_id}\n\n\
         ## Overview\n\nTwo small stories, parser first.\n\n\
         ## Implementation Plan\n\n\
         1. US-001: extend the parser.\n\
         2. US-002: wire the new parser into the entry point.\n"
    )
}

/// The backlog the mock saves during planning.
pub fn mock_backlog(item_id: &str, branch_name: &str) -> Backlog {
    let story = |n: u32, title: &str, priority: u8| Story {
        id: format!("US-{n:03}"),
        title: title.to_string(),
        acceptance_criteria: vec![
            format!("{title} is covered by a unit test"),
            "existing behaviour is unchanged".to_string(),
        ],
        priority,
        status: StoryStatus::Pending,
        notes: String::new(),
    };
    Backlog {
        schema_version: BACKLOG_SCHEMA_VERSION,
        id: item_id.to_string(),
        branch_name: branch_name.to_string(),
        user_stories: vec![
            story(1, "Extend the parser", 1),
            story(2, "Wire the parser into the entry point", 2),
        ],
    }
}
