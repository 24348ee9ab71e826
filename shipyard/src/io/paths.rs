//! Canonical locations inside the `.shipyard/` store.

use std::path::{Path, PathBuf};

use crate::core::artifacts::Artifact;
use crate::core::states::Phase;

/// Store directory name under the repository root.
pub const STORE_DIR: &str = ".shipyard";
/// Prompt templates that may be overridden under `prompts/`.
pub const PROMPT_NAMES: [&str; 4] = ["research", "plan", "implement", "pr_body"];

#[derive(Debug, Clone)]
pub struct StorePaths {
    repo_root: PathBuf,
    store: PathBuf,
}

impl StorePaths {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let store = repo_root.join(STORE_DIR);
        Self { repo_root, store }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn store_dir(&self) -> &Path {
        &self.store
    }

    pub fn config(&self) -> PathBuf {
        self.store.join("config.toml")
    }

    pub fn index(&self) -> PathBuf {
        self.store.join("index.json")
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.store.join("batch-progress.json")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.store.join("prompts")
    }

    pub fn prompt_override(&self, name: &str) -> PathBuf {
        self.prompts_dir().join(format!("{name}.md"))
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.store.join("backups")
    }

    pub fn items_dir(&self) -> PathBuf {
        self.store.join("items")
    }

    pub fn item_dir(&self, id: &str) -> PathBuf {
        self.items_dir().join(id)
    }

    pub fn item_file(&self, id: &str) -> PathBuf {
        self.item_dir(id).join("item.json")
    }

    pub fn research(&self, id: &str) -> PathBuf {
        self.item_dir(id).join("research.md")
    }

    pub fn plan(&self, id: &str) -> PathBuf {
        self.item_dir(id).join("plan.md")
    }

    pub fn prd(&self, id: &str) -> PathBuf {
        self.item_dir(id).join("prd.json")
    }

    pub fn progress_log(&self, id: &str) -> PathBuf {
        self.item_dir(id).join("progress.log")
    }

    /// File backing a file artifact; `None` for the PR reference.
    pub fn artifact(&self, id: &str, artifact: Artifact) -> Option<PathBuf> {
        artifact.file_name().map(|name| self.item_dir(id).join(name))
    }

    /// Per-item log directory (agent output, gate output).
    pub fn logs_dir(&self, id: &str) -> PathBuf {
        self.store.join("logs").join(id)
    }

    /// Agent output log for one invocation.
    pub fn agent_log(&self, id: &str, phase: Phase, stamp: &str) -> PathBuf {
        self.logs_dir(id)
            .join(format!("{}-{stamp}.log", phase.as_str()))
    }

    /// Path relative to the repo root, with `/` separators (for prompts and git).
    pub fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.repo_root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_in_store_dir() {
        let paths = StorePaths::new("/repo");
        assert_eq!(paths.item_file("001-a"), Path::new("/repo/.shipyard/items/001-a/item.json"));
        assert_eq!(
            paths.relative(&paths.plan("001-a")),
            ".shipyard/items/001-a/plan.md"
        );
        assert_eq!(
            paths.agent_log("001-a", Phase::Plan, "20240101T000000Z"),
            Path::new("/repo/.shipyard/logs/001-a/plan-20240101T000000Z.log")
        );
    }
}
