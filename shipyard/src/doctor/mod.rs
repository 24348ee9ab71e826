//! Diagnostics over the whole store, and repair of the fixable ones.
//!
//! `scan` never mutates anything. `repair` acts only on diagnostics that carry
//! a [`Fix`], backing up every file it touches into one session first.

pub mod repair;
pub mod scan;

use std::fmt;
use std::path::PathBuf;

use crate::item::ItemState;

pub use repair::{FixResult, RepairReport, repair};
pub use scan::scan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Code {
    ConfigInvalid,
    MissingPromptTemplates,
    PromptTemplateInvalid,
    ItemUnreadable,
    ItemInvalid,
    ItemIoError,
    StateArtifactMismatch,
    BacklogInvalid,
    StoryQuality,
    DependencyCycle,
    DanglingDependency,
    IndexMissing,
    IndexUnreadable,
    IndexStale,
    CheckpointStale,
    CheckpointUnreadable,
    StaleLock,
    BackendUnreachable,
    OrphanedResource,
}

impl Code {
    pub fn as_str(self) -> &'static str {
        match self {
            Code::ConfigInvalid => "config-invalid",
            Code::MissingPromptTemplates => "missing-prompt-templates",
            Code::PromptTemplateInvalid => "prompt-template-invalid",
            Code::ItemUnreadable => "item-unreadable",
            Code::ItemInvalid => "item-invalid",
            Code::ItemIoError => "item-io-error",
            Code::StateArtifactMismatch => "state-artifact-mismatch",
            Code::BacklogInvalid => "backlog-invalid",
            Code::StoryQuality => "story-quality",
            Code::DependencyCycle => "dependency-cycle",
            Code::DanglingDependency => "dangling-dependency",
            Code::IndexMissing => "index-missing",
            Code::IndexUnreadable => "index-unreadable",
            Code::IndexStale => "index-stale",
            Code::CheckpointStale => "checkpoint-stale",
            Code::CheckpointUnreadable => "checkpoint-unreadable",
            Code::StaleLock => "stale-lock",
            Code::BackendUnreachable => "backend-unreachable",
            Code::OrphanedResource => "orphaned-resource",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation that resolves a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fix {
    RebuildIndex,
    WriteDefaultPrompts,
    /// Move an item back to the highest state its artifacts support.
    DowngradeState { item_id: String, to: ItemState },
    RemoveCheckpoint,
    RemoveLock { path: PathBuf },
    TerminateResource { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: Code,
    pub severity: Severity,
    /// Item id, or the store-level area (`config`, `index`, ...).
    pub scope: String,
    pub message: String,
    pub fix: Option<Fix>,
}

impl Diagnostic {
    pub fn new(
        code: Code,
        severity: Severity,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            code,
            severity,
            scope: scope.into(),
            message: message.into(),
            fix: None,
        }
    }

    pub fn fixable(mut self, fix: Fix) -> Self {
        self.fix = Some(fix);
        self
    }

    pub fn is_fixable(&self) -> bool {
        self.fix.is_some()
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<7} [{}] {}: {}", self.severity, self.code, self.scope, self.message)?;
        if self.is_fixable() {
            f.write_str(" (fixable)")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub diagnostics: Vec<Diagnostic>,
}

impl Report {
    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn errors(&self) -> usize {
        self.count(Severity::Error)
    }

    pub fn warnings(&self) -> usize {
        self.count(Severity::Warning)
    }

    pub fn fixable(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_fixable())
    }

    pub fn with_code(&self, code: Code) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(move |d| d.code == code)
    }

    pub fn is_healthy(&self) -> bool {
        self.errors() == 0
    }

    fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}
