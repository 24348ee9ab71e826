//! Artifact-presence table: which documents each state requires.

use std::fmt;

use crate::item::ItemState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Research,
    Plan,
    Prd,
    PrReference,
}

impl Artifact {
    /// File name under the item directory, if the artifact is a file.
    pub fn file_name(self) -> Option<&'static str> {
        match self {
            Artifact::Research => Some("research.md"),
            Artifact::Plan => Some("plan.md"),
            Artifact::Prd => Some("prd.json"),
            Artifact::PrReference => None,
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Artifact::Research => "research.md",
            Artifact::Plan => "plan.md",
            Artifact::Prd => "prd.json",
            Artifact::PrReference => "pr reference",
        };
        f.write_str(name)
    }
}

/// Which artifacts are actually present for an item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArtifactPresence {
    pub research: bool,
    pub plan: bool,
    pub prd: bool,
    pub pr_reference: bool,
}

impl ArtifactPresence {
    pub fn has(&self, artifact: Artifact) -> bool {
        match artifact {
            Artifact::Research => self.research,
            Artifact::Plan => self.plan,
            Artifact::Prd => self.prd,
            Artifact::PrReference => self.pr_reference,
        }
    }
}

/// Artifacts required to be present while an item is in `state`.
pub fn required_for(state: ItemState) -> &'static [Artifact] {
    match state {
        ItemState::Idea => &[],
        ItemState::Researched => &[Artifact::Research],
        ItemState::Planned | ItemState::Implementing | ItemState::Done => {
            &[Artifact::Research, Artifact::Plan, Artifact::Prd]
        }
        ItemState::InPr => &[
            Artifact::Research,
            Artifact::Plan,
            Artifact::Prd,
            Artifact::PrReference,
        ],
    }
}

/// Required artifacts absent for `state`.
pub fn missing_for(state: ItemState, present: &ArtifactPresence) -> Vec<Artifact> {
    required_for(state)
        .iter()
        .copied()
        .filter(|artifact| !present.has(*artifact))
        .collect()
}

/// The highest state at or below `state` whose table is satisfied.
///
/// Only ever downgrades; never returns a state after `state`.
pub fn consistent_state(state: ItemState, present: &ArtifactPresence) -> ItemState {
    ItemState::ALL
        .into_iter()
        .rev()
        .filter(|candidate| *candidate <= state)
        .find(|candidate| missing_for(*candidate, present).is_empty())
        .unwrap_or(ItemState::Idea)
}
