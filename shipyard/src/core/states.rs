//! Workflow graph: states, phases and the legal transitions between them.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::item::ItemState;

/// Out-of-graph transition. Always a programming or configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ItemState,
    pub to: ItemState,
}

/// Tool name for saving the structured backlog document.
pub const TOOL_SAVE_PRD: &str = "save_prd";
/// Tool name for marking a story's status.
pub const TOOL_UPDATE_STORY_STATUS: &str = "update_story_status";

/// Work that moves an item from one state to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Research,
    Plan,
    Implement,
    Pr,
    Complete,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Research,
        Phase::Plan,
        Phase::Implement,
        Phase::Pr,
        Phase::Complete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Research => "research",
            Phase::Plan => "plan",
            Phase::Implement => "implement",
            Phase::Pr => "pr",
            Phase::Complete => "complete",
        }
    }

    /// States from which this phase may start.
    ///
    /// The second slot lists re-entrant states (resume after a crash or `--force`).
    pub fn source_states(self) -> (&'static [ItemState], &'static [ItemState]) {
        match self {
            Phase::Research => (&[ItemState::Idea], &[ItemState::Researched]),
            Phase::Plan => (&[ItemState::Researched], &[ItemState::Planned]),
            Phase::Implement => (&[ItemState::Planned, ItemState::Implementing], &[]),
            Phase::Pr => (&[ItemState::Implementing], &[ItemState::InPr]),
            Phase::Complete => (&[ItemState::InPr], &[]),
        }
    }

    pub fn accepts(self, state: ItemState) -> bool {
        let (primary, reentrant) = self.source_states();
        primary.contains(&state) || reentrant.contains(&state)
    }

    /// Structured operations the agent may call during this phase.
    pub fn allowed_tools(self) -> &'static [&'static str] {
        match self {
            Phase::Plan => &[TOOL_SAVE_PRD],
            Phase::Implement => &[TOOL_UPDATE_STORY_STATUS],
            Phase::Research | Phase::Pr | Phase::Complete => &[],
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Phase::ALL
            .into_iter()
            .find(|phase| phase.as_str() == s)
            .ok_or_else(|| anyhow!("unknown phase '{s}'"))
    }
}

/// Forward edges of the workflow graph.
pub fn is_legal_transition(from: ItemState, to: ItemState) -> bool {
    use ItemState::{Done, Idea, Implementing, InPr, Planned, Researched};
    matches!(
        (from, to),
        (Idea, Researched)
            | (Researched, Planned)
            | (Planned, Implementing)
            | (Implementing, InPr)
            | (Implementing, Done)
            | (InPr, Done)
    )
}

/// Validate a forward transition. Same-state writes are not transitions and pass.
pub fn check_transition(from: ItemState, to: ItemState) -> Result<(), TransitionError> {
    if from == to || is_legal_transition(from, to) {
        return Ok(());
    }
    Err(TransitionError { from, to })
}

/// The next phase an item in `state` is eligible for.
///
/// `backlog_complete` reports whether every story in the item's backlog is done.
pub fn next_phase(state: ItemState, backlog_complete: bool) -> Option<Phase> {
    match state {
        ItemState::Idea => Some(Phase::Research),
        ItemState::Researched => Some(Phase::Plan),
        ItemState::Planned => Some(Phase::Implement),
        ItemState::Implementing if backlog_complete => Some(Phase::Pr),
        ItemState::Implementing => Some(Phase::Implement),
        ItemState::InPr => Some(Phase::Complete),
        ItemState::Done => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_has_no_backward_edges() {
        for from in ItemState::ALL {
            for to in ItemState::ALL {
                if is_legal_transition(from, to) {
                    assert!(from < to, "{from} -> {to} goes backwards");
                }
            }
        }
    }

    #[test]
    fn skipping_states_is_illegal() {
        let err = check_transition(ItemState::Idea, ItemState::Planned).expect_err("illegal");
        assert_eq!(err.to_string(), "illegal transition idea -> planned");
        check_transition(ItemState::Implementing, ItemState::Done).expect("direct merge edge");
    }

    #[test]
    fn implement_accepts_resume_state() {
        assert!(Phase::Implement.accepts(ItemState::Planned));
        assert!(Phase::Implement.accepts(ItemState::Implementing));
        assert!(!Phase::Implement.accepts(ItemState::Researched));
    }

    #[test]
    fn next_phase_follows_backlog_completion() {
        assert_eq!(next_phase(ItemState::Implementing, false), Some(Phase::Implement));
        assert_eq!(next_phase(ItemState::Implementing, true), Some(Phase::Pr));
        assert_eq!(next_phase(ItemState::Done, true), None);
    }

    #[test]
    fn tool_allow_lists_are_phase_specific() {
        assert!(Phase::Research.allowed_tools().is_empty());
        assert_eq!(Phase::Plan.allowed_tools(), &[TOOL_SAVE_PRD]);
        assert_eq!(Phase::Implement.allowed_tools(), &[TOOL_UPDATE_STORY_STATUS]);
    }
}
