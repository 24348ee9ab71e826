//! Dependency graph over items: cycles, dangling references and readiness.

use std::collections::{BTreeMap, BTreeSet};

use crate::item::{Item, ItemState};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Node {
    state: ItemState,
    depends_on: Vec<String>,
}

/// Immutable snapshot of the dependency edges between items.
#[derive(Debug, Clone, Default)]
pub struct DepGraph {
    nodes: BTreeMap<String, Node>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl DepGraph {
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a Item>) -> Self {
        let nodes = items
            .into_iter()
            .map(|item| {
                (
                    item.id.clone(),
                    Node {
                        state: item.state,
                        depends_on: item.depends_on.clone(),
                    },
                )
            })
            .collect();
        Self { nodes }
    }

    pub fn insert(&mut self, id: &str, state: ItemState, depends_on: &[String]) {
        self.nodes.insert(
            id.to_string(),
            Node {
                state,
                depends_on: depends_on.to_vec(),
            },
        );
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn state(&self, id: &str) -> Option<ItemState> {
        self.nodes.get(id).map(|node| node.state)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// Every elementary cycle found by depth-first search, each reported once.
    ///
    /// A cycle is listed starting from its smallest id, e.g. `[a, b]` for `a -> b -> a`.
    pub fn cycles(&self) -> Vec<Vec<String>> {
        let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
        let mut stack: Vec<&str> = Vec::new();
        let mut found: BTreeSet<Vec<String>> = BTreeSet::new();
        for id in self.nodes.keys() {
            if !marks.contains_key(id.as_str()) {
                self.visit(id, &mut marks, &mut stack, &mut found);
            }
        }
        found.into_iter().collect()
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        found: &mut BTreeSet<Vec<String>>,
    ) {
        marks.insert(id, Mark::Visiting);
        stack.push(id);
        if let Some(node) = self.nodes.get(id) {
            for dep in &node.depends_on {
                match marks.get(dep.as_str()) {
                    Some(Mark::Visiting) => {
                        if let Some(pos) = stack.iter().position(|entry| *entry == dep.as_str())
                        {
                            found.insert(normalize_cycle(&stack[pos..]));
                        }
                    }
                    Some(Mark::Done) => {}
                    None if self.nodes.contains_key(dep.as_str()) => {
                        self.visit(dep, marks, stack, found);
                    }
                    None => {}
                }
            }
        }
        stack.pop();
        marks.insert(id, Mark::Done);
    }

    /// Ids that sit on at least one cycle.
    pub fn cyclic_members(&self) -> BTreeSet<String> {
        self.cycles().into_iter().flatten().collect()
    }

    /// `(item, missing dependency)` pairs.
    pub fn dangling(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for (id, node) in &self.nodes {
            for dep in &node.depends_on {
                if !self.nodes.contains_key(dep) {
                    out.push((id.clone(), dep.clone()));
                }
            }
        }
        out
    }

    /// Items that can never be scheduled: on a cycle, depending on a missing item,
    /// or depending (transitively) on such an item.
    pub fn unschedulable(&self) -> BTreeSet<String> {
        let mut blocked = self.cyclic_members();
        blocked.extend(self.dangling().into_iter().map(|(id, _)| id));
        self.close_over_dependents(blocked)
    }

    /// Extend `seed` with every item that depends on a member, transitively.
    pub fn close_over_dependents(&self, mut seed: BTreeSet<String>) -> BTreeSet<String> {
        loop {
            let before = seed.len();
            for (id, node) in &self.nodes {
                if node.depends_on.iter().any(|dep| seed.contains(dep)) {
                    seed.insert(id.clone());
                }
            }
            if seed.len() == before {
                return seed;
            }
        }
    }

    /// True when the item exists, is not terminal, and every dependency is terminal.
    pub fn is_ready(&self, id: &str) -> bool {
        let Some(node) = self.nodes.get(id) else {
            return false;
        };
        if node.state.is_terminal() {
            return false;
        }
        node.depends_on.iter().all(|dep| {
            self.nodes
                .get(dep)
                .is_some_and(|dep_node| dep_node.state.is_terminal())
        })
    }

    /// Ready ids in id order, excluding anything unschedulable.
    pub fn ready_ids(&self) -> Vec<String> {
        let blocked = self.unschedulable();
        self.nodes
            .keys()
            .filter(|id| !blocked.contains(*id) && self.is_ready(id))
            .cloned()
            .collect()
    }
}

fn normalize_cycle(members: &[&str]) -> Vec<String> {
    let start = members
        .iter()
        .enumerate()
        .min_by_key(|(_, id)| **id)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    members[start..]
        .iter()
        .chain(members[..start].iter())
        .map(|id| (*id).to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `deps` is a comma-separated list of dependency ids.
    fn graph(edges: &[(&str, ItemState, &str)]) -> DepGraph {
        let mut g = DepGraph::default();
        for (id, state, deps) in edges {
            let deps: Vec<String> = deps
                .split(',')
                .filter(|d| !d.is_empty())
                .map(str::to_string)
                .collect();
            g.insert(id, *state, &deps);
        }
        g
    }

    /// With A -> B (B depends on A), B is only ready after A is done.
    #[test]
    fn dependent_waits_for_terminal_dependency() {
        let g = graph(&[
            ("001-a", ItemState::Implementing, ""),
            ("002-b", ItemState::Idea, "001-a"),
        ]);
        assert_eq!(g.ready_ids(), vec!["001-a".to_string()]);

        let g = graph(&[
            ("001-a", ItemState::Done, ""),
            ("002-b", ItemState::Idea, "001-a"),
        ]);
        assert_eq!(g.ready_ids(), vec!["002-b".to_string()]);
    }

    #[test]
    fn two_cycle_is_reported_once_and_never_ready() {
        let g = graph(&[
            ("001-a", ItemState::Idea, "002-b"),
            ("002-b", ItemState::Idea, "001-a"),
            ("003-c", ItemState::Idea, "002-b"),
            ("004-d", ItemState::Idea, ""),
        ]);
        assert_eq!(
            g.cycles(),
            vec![vec!["001-a".to_string(), "002-b".to_string()]]
        );
        let blocked = g.unschedulable();
        assert!(blocked.contains("003-c"), "dependents of a cycle are blocked");
        assert_eq!(g.ready_ids(), vec!["004-d".to_string()]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let g = graph(&[("001-a", ItemState::Idea, "001-a")]);
        assert_eq!(g.cycles(), vec![vec!["001-a".to_string()]]);
    }

    #[test]
    fn dangling_dependency_is_reported() {
        let g = graph(&[("002-b", ItemState::Idea, "009-missing")]);
        assert_eq!(
            g.dangling(),
            vec![("002-b".to_string(), "009-missing".to_string())]
        );
        assert!(g.ready_ids().is_empty());
    }
}
