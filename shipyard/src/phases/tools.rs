//! Structured tool calls the agent may make, and their effects on the store.

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::PhaseError;
use crate::agent::ToolCall;
use crate::backlog::{Backlog, StoryStatus};
use crate::core::quality::prd_issues;
use crate::core::states::Phase;
use crate::io::store::Store;

/// Reject the whole result if any call names a tool outside the phase allow-list.
pub fn ensure_permitted(phase: Phase, calls: &[ToolCall]) -> Result<(), PhaseError> {
    let allowed = phase.allowed_tools();
    match calls.iter().find(|call| !allowed.contains(&call.name.as_str())) {
        Some(call) => Err(PhaseError::ToolNotPermitted {
            tool: call.name.clone(),
            phase,
        }),
        None => Ok(()),
    }
}

/// Validate and persist a backlog document submitted by the planner.
pub fn save_prd(
    store: &Store,
    item_id: &str,
    min_criteria: usize,
    input: &Value,
) -> Result<Backlog, PhaseError> {
    let doc: Backlog = serde_json::from_value(input.clone())
        .map_err(|err| PhaseError::Quality(vec![format!("save_prd input is not a valid backlog: {err}")]))?;
    let issues = prd_issues(&doc, item_id, min_criteria);
    if !issues.is_empty() {
        return Err(PhaseError::Quality(issues));
    }
    store.write_prd(item_id, &doc)?;
    info!(item = item_id, stories = doc.user_stories.len(), "backlog saved");
    Ok(doc)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StoryUpdate {
    pub story_id: String,
    pub status: StoryStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Apply one `update_story_status` call to the in-memory backlog.
pub fn update_story_status(doc: &mut Backlog, input: &Value) -> Result<StoryUpdate, PhaseError> {
    let update: StoryUpdate = serde_json::from_value(input.clone()).map_err(|err| {
        PhaseError::Quality(vec![format!("update_story_status input is invalid: {err}")])
    })?;
    let story = doc.story_mut(&update.story_id).ok_or_else(|| {
        PhaseError::Quality(vec![format!(
            "update_story_status names unknown story {}",
            update.story_id
        )])
    })?;
    story.status = update.status;
    if let Some(notes) = update.notes.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        story.notes = notes.to_string();
    }
    debug!(story = %update.story_id, status = ?update.status, "story status updated");
    Ok(update)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::agent::mock::mock_backlog;
    use crate::core::states::{TOOL_SAVE_PRD, TOOL_UPDATE_STORY_STATUS};

    fn call(name: &str) -> ToolCall {
        ToolCall {
            name: name.to_string(),
            input: Value::Null,
        }
    }

    #[test]
    fn research_permits_no_tools() {
        let err = ensure_permitted(Phase::Research, &[call(TOOL_SAVE_PRD)]).expect_err("denied");
        assert!(matches!(err, PhaseError::ToolNotPermitted { ref tool, .. } if tool == "save_prd"));
        ensure_permitted(Phase::Research, &[]).expect("no calls is fine");
    }

    #[test]
    fn implement_permits_only_status_updates() {
        ensure_permitted(Phase::Implement, &[call(TOOL_UPDATE_STORY_STATUS)]).expect("allowed");
        assert!(ensure_permitted(Phase::Implement, &[call(TOOL_SAVE_PRD)]).is_err());
    }

    #[test]
    fn status_update_marks_story_and_keeps_notes() {
        let mut doc = mock_backlog("001-x", "shipyard/001-x");
        let update = update_story_status(
            &mut doc,
            &json!({"story_id": "US-002", "status": "done", "notes": " wired up "}),
        )
        .expect("update");
        assert_eq!(update.story_id, "US-002");
        let story = doc.story_mut("US-002").expect("story");
        assert_eq!(story.status, StoryStatus::Done);
        assert_eq!(story.notes, "wired up");
    }

    #[test]
    fn status_update_for_unknown_story_is_rejected() {
        let mut doc = mock_backlog("001-x", "shipyard/001-x");
        let err = update_story_status(&mut doc, &json!({"story_id": "US-404", "status": "done"}))
            .expect_err("unknown story");
        assert!(err.to_string().contains("US-404"));
    }
}
