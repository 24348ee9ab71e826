//! Prompt rendering for agent invocations.
//!
//! Built-in templates are compiled in; a file at `.shipyard/prompts/<name>.md`
//! replaces the built-in template of the same name.

use std::fs;
use std::io;

use anyhow::{Context, Result, anyhow};
use minijinja::Environment;
use serde::Serialize;
use tracing::debug;

use crate::backlog::Story;
use crate::item::{Intake, Item};
use crate::io::config::Config;
use crate::io::paths::{PROMPT_NAMES, StorePaths};

const RESEARCH_TEMPLATE: &str = include_str!("prompts/research.md");
const PLAN_TEMPLATE: &str = include_str!("prompts/plan.md");
const IMPLEMENT_TEMPLATE: &str = include_str!("prompts/implement.md");
const PR_BODY_TEMPLATE: &str = include_str!("prompts/pr_body.md");

/// Built-in template text for `name`.
pub fn default_template(name: &str) -> Option<&'static str> {
    match name {
        "research" => Some(RESEARCH_TEMPLATE),
        "plan" => Some(PLAN_TEMPLATE),
        "implement" => Some(IMPLEMENT_TEMPLATE),
        "pr_body" => Some(PR_BODY_TEMPLATE),
        _ => None,
    }
}

/// Override files absent from the prompts directory.
pub fn missing_overrides(paths: &StorePaths) -> Vec<&'static str> {
    PROMPT_NAMES
        .iter()
        .copied()
        .filter(|name| !paths.prompt_override(name).is_file())
        .collect()
}

/// Parse a template without rendering it.
pub fn check_template(source: &str) -> Result<()> {
    let env = Environment::new();
    env.template_from_str(source)
        .map(|_| ())
        .map_err(|err| anyhow!("template does not parse: {err}"))
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactPaths {
    pub research: String,
    pub plan: String,
    pub prd: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QualityHints {
    pub min_citations: usize,
    pub min_acceptance_criteria: usize,
}

/// Everything a template may reference.
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext<'a> {
    pub item: &'a Item,
    pub intake: Option<&'a Intake>,
    pub paths: ArtifactPaths,
    pub quality: QualityHints,
    pub completion_signal: &'a str,
    pub branch: Option<&'a str>,
    pub last_error: Option<&'a str>,
    pub story: Option<&'a Story>,
    pub stories: &'a [Story],
    pub pending_stories: usize,
    pub iteration: u32,
}

impl<'a> PromptContext<'a> {
    pub fn new(item: &'a Item, paths: &StorePaths, config: &'a Config) -> Self {
        Self {
            item,
            intake: item.intake.as_ref(),
            paths: ArtifactPaths {
                research: paths.relative(&paths.research(&item.id)),
                plan: paths.relative(&paths.plan(&item.id)),
                prd: paths.relative(&paths.prd(&item.id)),
            },
            quality: QualityHints {
                min_citations: config.quality.min_citations,
                min_acceptance_criteria: config.quality.min_acceptance_criteria,
            },
            completion_signal: &config.agent.completion_signal,
            branch: item.branch.as_deref(),
            last_error: item
                .last_error
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty()),
            story: None,
            stories: &[],
            pending_stories: 0,
            iteration: 0,
        }
    }

    pub fn with_branch(mut self, branch: &'a str) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn with_story(mut self, story: &'a Story, iteration: u32, pending: usize) -> Self {
        self.story = Some(story);
        self.iteration = iteration;
        self.pending_stories = pending;
        self
    }

    pub fn with_stories(mut self, stories: &'a [Story]) -> Self {
        self.stories = stories;
        self
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
    paths: StorePaths,
}

impl PromptEngine {
    pub fn new(paths: &StorePaths) -> Self {
        let mut env = Environment::new();
        for name in PROMPT_NAMES {
            if let Some(source) = default_template(name) {
                env.add_template(name, source)
                    .expect("built-in prompt template should be valid");
            }
        }
        Self {
            env,
            paths: paths.clone(),
        }
    }

    /// Render `name`, preferring the store override when one exists.
    pub fn render(&self, name: &str, ctx: &PromptContext<'_>) -> Result<String> {
        let override_path = self.paths.prompt_override(name);
        match fs::read_to_string(&override_path) {
            Ok(source) => {
                debug!(template = name, path = %override_path.display(), "using prompt override");
                return self
                    .env
                    .render_str(&source, ctx)
                    .with_context(|| format!("render prompt override {}", override_path.display()));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read prompt override {}", override_path.display()));
            }
        }
        let template = self
            .env
            .get_template(name)
            .with_context(|| format!("unknown prompt template '{name}'"))?;
        template
            .render(ctx)
            .with_context(|| format!("render prompt template '{name}'"))
    }
}
