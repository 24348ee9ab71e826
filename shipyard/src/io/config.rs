//! Store configuration at `.shipyard/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};

use crate::io::atomic::write_atomic;
use crate::io::lock::LockSettings;

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_COMPLETION_SIGNAL: &str = "<promise>COMPLETE</promise>";

/// Shipyard configuration (TOML).
///
/// Edited by humans; every field has a default so a missing file or section is
/// fine. Unknown keys are rejected so typos never silently fall back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub schema_version: u32,
    /// Branch that item branches are cut from and merged into.
    pub base_branch: String,
    /// Prefix for item branches (`<prefix><item id>`).
    pub branch_prefix: String,
    pub merge_mode: MergeMode,
    /// Upper bound on implementation iterations per `implement` run.
    pub max_iterations: u32,
    /// Default batch worker count.
    pub parallel: usize,
    #[serde(deserialize_with = "deserialize_agent")]
    pub agent: AgentConfig,
    pub quality: QualityConfig,
    pub merge: MergeConfig,
    pub compute: ComputeConfig,
    pub doctor: DoctorConfig,
    pub lock: LockConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            base_branch: "main".to_string(),
            branch_prefix: "shipyard/".to_string(),
            merge_mode: MergeMode::Pr,
            max_iterations: 100,
            parallel: 1,
            agent: AgentConfig::default(),
            quality: QualityConfig::default(),
            merge: MergeConfig::default(),
            compute: ComputeConfig::default(),
            doctor: DoctorConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Push the branch and open a review request.
    Pr,
    /// Merge straight into the base branch, no review.
    Direct,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Plain subprocess; completion is a marker on stdout.
    Process,
    /// Subprocess emitting JSON-lines events; completion is a clean end of stream.
    EventStream,
    /// Deterministic in-process agent for tests and dry runs.
    Mock,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    pub kind: AgentKind,
    pub command: String,
    pub args: Vec<String>,
    pub completion_signal: String,
    pub timeout_secs: u64,
    /// Seconds between the graceful terminate request and a forced kill.
    pub kill_grace_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kind: AgentKind::Process,
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
            completion_signal: DEFAULT_COMPLETION_SIGNAL.to_string(),
            timeout_secs: 3600,
            kill_grace_secs: 10,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

/// Older agent section: `mode = "process" | "sdk"` with command/args/signal only.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LegacyAgentConfig {
    pub mode: LegacyMode,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub completion_signal: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LegacyMode {
    Process,
    Sdk,
}

/// The two accepted shapes of `[agent]`. Anything matching neither is rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AgentSection {
    Current(AgentConfig),
    Legacy(LegacyAgentConfig),
}

impl From<AgentSection> for AgentConfig {
    fn from(section: AgentSection) -> Self {
        match section {
            AgentSection::Current(cfg) => cfg,
            AgentSection::Legacy(legacy) => {
                let defaults = AgentConfig::default();
                AgentConfig {
                    kind: match legacy.mode {
                        LegacyMode::Process => AgentKind::Process,
                        LegacyMode::Sdk => AgentKind::EventStream,
                    },
                    command: legacy.command.unwrap_or(defaults.command),
                    args: legacy.args.unwrap_or(defaults.args),
                    completion_signal: legacy
                        .completion_signal
                        .unwrap_or(defaults.completion_signal),
                    ..defaults
                }
            }
        }
    }
}

fn deserialize_agent<'de, D>(deserializer: D) -> std::result::Result<AgentConfig, D::Error>
where
    D: Deserializer<'de>,
{
    let section = AgentSection::deserialize(deserializer).map_err(|_| {
        serde::de::Error::custom(
            "[agent] matches neither the current shape (kind = ...) nor the legacy shape (mode = ...)",
        )
    })?;
    Ok(section.into())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerifyMode {
    /// Failed verification logs a warning; the story stays done.
    Warn,
    /// Failed verification reverts the story to pending.
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct QualityConfig {
    pub min_citations: usize,
    pub min_acceptance_criteria: usize,
    pub verify_acceptance: VerifyMode,
    /// Commands (argv arrays) run after a story is marked done.
    pub verify_commands: Vec<Vec<String>>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_citations: 3,
            min_acceptance_criteria: 2,
            verify_acceptance: VerifyMode::Warn,
            verify_commands: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct MergeConfig {
    pub remote: String,
    /// Quality-gate commands (argv arrays) that must pass before any push.
    pub quality_gates: Vec<Vec<String>>,
    pub gate_timeout_secs: u64,
    /// Glob patterns (`*`, `?`) the remote URL must match. Empty allows any remote.
    pub allowed_remote_patterns: Vec<String>,
    pub secret_scan: bool,
    pub draft: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            quality_gates: Vec::new(),
            gate_timeout_secs: 30 * 60,
            allowed_remote_patterns: Vec::new(),
            secret_scan: true,
            draft: false,
        }
    }
}

impl MergeConfig {
    /// Compile `allowed_remote_patterns` into anchored regexes.
    pub fn remote_matchers(&self) -> Result<Vec<Regex>> {
        self.allowed_remote_patterns
            .iter()
            .map(|pattern| glob_to_regex(pattern))
            .collect()
    }
}

/// Translate a `*`/`?` glob into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).with_context(|| format!("invalid remote pattern '{pattern}'"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComputeKind {
    Local,
    Vm,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ComputeConfig {
    pub kind: ComputeKind,
    /// VM manager binary.
    pub binary: String,
    /// Image to launch; provider default when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub memory_mb: u64,
    pub cpus: u32,
    /// Where the repository is mounted inside the VM.
    pub mount_target: String,
    /// VMs younger than this are never reported as orphans.
    pub orphan_min_age_secs: u64,
    /// Running VMs older than this are orphans even if their owner is alive.
    pub orphan_max_age_secs: u64,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            kind: ComputeKind::Local,
            binary: "multipass".to_string(),
            image: None,
            memory_mb: 4096,
            cpus: 2,
            mount_target: "/workspace".to_string(),
            orphan_min_age_secs: 300,
            orphan_max_age_secs: 4 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DoctorConfig {
    /// Backup sessions kept after pruning.
    pub backup_retention: usize,
    /// A batch checkpoint older than this is stale even if its owner is alive.
    pub checkpoint_stale_secs: u64,
}

impl Default for DoctorConfig {
    fn default() -> Self {
        Self {
            backup_retention: 10,
            checkpoint_stale_secs: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LockConfig {
    pub stale_secs: u64,
    pub timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_secs: 60,
            timeout_ms: 10_000,
        }
    }
}

impl LockConfig {
    pub fn settings(&self) -> LockSettings {
        LockSettings {
            stale_after: Duration::from_secs(self.stale_secs),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version != CONFIG_SCHEMA_VERSION {
            bail!(
                "unsupported config schema_version {} (expected {CONFIG_SCHEMA_VERSION})",
                self.schema_version
            );
        }
        if self.base_branch.trim().is_empty() {
            return Err(anyhow!("base_branch must be non-empty"));
        }
        if self.branch_prefix.trim().is_empty() || self.branch_prefix.contains(char::is_whitespace)
        {
            return Err(anyhow!("branch_prefix must be non-empty without whitespace"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.parallel == 0 {
            return Err(anyhow!("parallel must be >= 1"));
        }
        self.validate_agent()?;
        for (idx, cmd) in self.quality.verify_commands.iter().enumerate() {
            validate_argv(cmd).with_context(|| format!("quality.verify_commands[{idx}]"))?;
        }
        for (idx, cmd) in self.merge.quality_gates.iter().enumerate() {
            validate_argv(cmd).with_context(|| format!("merge.quality_gates[{idx}]"))?;
        }
        if self.merge.remote.trim().is_empty() {
            return Err(anyhow!("merge.remote must be non-empty"));
        }
        if self.merge.gate_timeout_secs == 0 {
            return Err(anyhow!("merge.gate_timeout_secs must be > 0"));
        }
        self.merge.remote_matchers()?;
        self.validate_compute()?;
        if self.doctor.backup_retention == 0 {
            return Err(anyhow!("doctor.backup_retention must be >= 1"));
        }
        if self.doctor.checkpoint_stale_secs == 0 {
            return Err(anyhow!("doctor.checkpoint_stale_secs must be > 0"));
        }
        if self.lock.stale_secs == 0 || self.lock.timeout_ms == 0 {
            return Err(anyhow!("lock.stale_secs and lock.timeout_ms must be > 0"));
        }
        Ok(())
    }

    fn validate_agent(&self) -> Result<()> {
        let agent = &self.agent;
        if agent.kind != AgentKind::Mock && agent.command.trim().is_empty() {
            return Err(anyhow!("agent.command must be non-empty"));
        }
        if agent.completion_signal.trim().is_empty() {
            return Err(anyhow!("agent.completion_signal must be non-empty"));
        }
        if agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        Ok(())
    }

    fn validate_compute(&self) -> Result<()> {
        let compute = &self.compute;
        if compute.kind != ComputeKind::Vm {
            return Ok(());
        }
        if compute.binary.trim().is_empty() {
            return Err(anyhow!("compute.binary must be non-empty"));
        }
        if compute.memory_mb < 512 {
            return Err(anyhow!("compute.memory_mb must be >= 512"));
        }
        if compute.cpus == 0 {
            return Err(anyhow!("compute.cpus must be >= 1"));
        }
        if !compute.mount_target.starts_with('/') {
            return Err(anyhow!("compute.mount_target must be an absolute path"));
        }
        if compute.orphan_min_age_secs > compute.orphan_max_age_secs {
            return Err(anyhow!(
                "compute.orphan_min_age_secs must not exceed orphan_max_age_secs"
            ));
        }
        Ok(())
    }
}

fn validate_argv(cmd: &[String]) -> Result<()> {
    match cmd.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(anyhow!("command must be a non-empty argv array")),
    }
}

/// Parse and validate config text.
pub fn parse_config(contents: &str) -> Result<Config> {
    let cfg: Config = toml::from_str(contents).context("parse config toml")?;
    cfg.validate()?;
    Ok(cfg)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `Config::default()`.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        let cfg = Config::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("load {}", path.display()))
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &Config) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = Config::default();
        cfg.merge.quality_gates = vec![vec!["cargo".to_string(), "test".to_string()]];
        cfg.compute.kind = ComputeKind::Vm;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    /// Legacy `mode = "sdk"` maps to the event-stream agent, keeping other defaults.
    #[test]
    fn legacy_agent_shape_is_converted() {
        let cfg = parse_config(
            "[agent]\nmode = \"sdk\"\ncommand = \"agent-cli\"\ncompletion_signal = \"DONE\"\n",
        )
        .expect("parse");
        assert_eq!(cfg.agent.kind, AgentKind::EventStream);
        assert_eq!(cfg.agent.command, "agent-cli");
        assert_eq!(cfg.agent.completion_signal, "DONE");
        assert_eq!(cfg.agent.timeout_secs, AgentConfig::default().timeout_secs);
    }

    #[test]
    fn current_agent_shape_is_accepted() {
        let cfg = parse_config("[agent]\nkind = \"mock\"\ntimeout_secs = 5\n").expect("parse");
        assert_eq!(cfg.agent.kind, AgentKind::Mock);
        assert_eq!(cfg.agent.timeout_secs, 5);
    }

    #[test]
    fn mixed_agent_shape_is_rejected() {
        let err = parse_config("[agent]\nkind = \"process\"\nmode = \"process\"\n")
            .expect_err("neither shape");
        assert!(format!("{err:#}").contains("neither"), "{err:#}");
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        assert!(parse_config("paralel = 4\n").is_err());
    }

    #[test]
    fn invalid_values_fail_fast() {
        assert!(parse_config("parallel = 0\n").is_err());
        assert!(parse_config("[merge]\nquality_gates = [[]]\n").is_err());
        assert!(
            parse_config("[compute]\nkind = \"vm\"\norphan_min_age_secs = 10\norphan_max_age_secs = 5\n")
                .is_err()
        );
    }

    #[test]
    fn remote_globs_are_anchored() {
        let merge = MergeConfig {
            allowed_remote_patterns: vec!["git@github.com:acme/*".to_string()],
            ..MergeConfig::default()
        };
        let matchers = merge.remote_matchers().expect("compile");
        assert!(matchers[0].is_match("git@github.com:acme/app.git"));
        assert!(!matchers[0].is_match("git@github.com:evil/acme/app.git"));
        assert!(!matchers[0].is_match("xgit@github.com:acme/app.git"));
    }
}
