//! Isolated execution in an ephemeral VM, one per invocation.
//!
//! VM names encode creation time and the owning pid
//! (`shipyard-<unix secs>-<pid>-<item>`) so orphans can be judged from the
//! provider's listing alone, without any local bookkeeping.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{BackendError, ComputeBackend, OrphanResource};
use crate::agent::{Agent, AgentRequest, AgentResult, Launcher};
use crate::interrupt::Interrupt;
use crate::io::config::ComputeConfig;
use crate::io::pid::pid_alive;
use crate::io::process::run_command_with_timeout;

pub const VM_NAME_PREFIX: &str = "shipyard-";
const MAX_VM_NAME: usize = 63;
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(600);
const PROVIDER_OUTPUT_LIMIT: usize = 256 * 1024;

/// Parameters for one VM launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub memory_mb: u64,
    pub cpus: u32,
    pub image: Option<String>,
    pub mount_source: PathBuf,
    pub mount_target: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmInstance {
    pub name: String,
    /// Provider-reported state, e.g. `Running`, `Stopped`.
    pub state: String,
}

impl VmInstance {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// VM manager operations, abstracted for tests.
pub trait VmProvider: Send + Sync {
    fn check_available(&self) -> Result<(), BackendError>;
    fn launch(&self, spec: &VmSpec) -> Result<(), BackendError>;
    /// Command running `program` inside `name` from `workdir`.
    fn exec_command(&self, name: &str, workdir: &str, program: &str, args: &[String]) -> Command;
    /// Idempotent: deleting an absent VM succeeds.
    fn delete(&self, name: &str) -> Result<(), BackendError>;
    fn list(&self) -> Result<Vec<VmInstance>, BackendError>;
}

/// Build a VM name for an invocation.
pub fn vm_name(now: DateTime<Utc>, pid: u32, item_id: &str) -> String {
    let mut name = format!("{VM_NAME_PREFIX}{}-{pid}-{item_id}", now.timestamp());
    name.truncate(MAX_VM_NAME);
    name.trim_end_matches('-').to_string()
}

/// Creation time and owner pid encoded in a shipyard VM name.
pub fn parse_vm_name(name: &str) -> Option<(DateTime<Utc>, u32)> {
    let rest = name.strip_prefix(VM_NAME_PREFIX)?;
    let mut parts = rest.splitn(3, '-');
    let secs: i64 = parts.next()?.parse().ok()?;
    let pid: u32 = parts.next()?.parse().ok()?;
    Some((DateTime::from_timestamp(secs, 0)?, pid))
}

/// Why a VM counts as orphaned, or `None` if it should be left alone.
///
/// VMs younger than `min_age` are never orphans: they may still be starting.
pub fn orphan_reason(
    age: Duration,
    owner_alive: bool,
    running: bool,
    min_age: Duration,
    max_age: Duration,
) -> Option<String> {
    if age < min_age {
        return None;
    }
    if !owner_alive {
        return Some("owning process is gone".to_string());
    }
    if running && age > max_age {
        return Some(format!(
            "still running after {}s (limit {}s)",
            age.as_secs(),
            max_age.as_secs()
        ));
    }
    None
}

pub struct VmBackend {
    agent: Arc<dyn Agent>,
    provider: Arc<dyn VmProvider>,
    config: ComputeConfig,
}

impl VmBackend {
    pub fn new(agent: Arc<dyn Agent>, provider: Arc<dyn VmProvider>, config: ComputeConfig) -> Self {
        Self {
            agent,
            provider,
            config,
        }
    }
}

/// Deletes the VM when dropped, whatever path left the invocation.
struct Teardown {
    provider: Arc<dyn VmProvider>,
    name: String,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        match self.provider.delete(&self.name) {
            Ok(()) => info!(vm = %self.name, "vm torn down"),
            Err(err) => warn!(vm = %self.name, err = %err, "vm teardown failed; doctor will report it"),
        }
    }
}

struct VmLauncher<'a> {
    provider: &'a dyn VmProvider,
    name: &'a str,
    mount_target: &'a str,
}

impl Launcher for VmLauncher<'_> {
    fn command(&self, program: &str, args: &[String], _workdir: &Path) -> Command {
        self.provider
            .exec_command(self.name, self.mount_target, program, args)
    }
}

impl ComputeBackend for VmBackend {
    fn name(&self) -> &'static str {
        "vm"
    }

    #[instrument(skip_all, fields(backend = "vm", item = %request.item_id, phase = %request.phase))]
    fn execute(
        &self,
        request: &AgentRequest,
        interrupt: &Interrupt,
    ) -> Result<AgentResult, BackendError> {
        self.provider.check_available()?;
        let spec = VmSpec {
            name: vm_name(Utc::now(), std::process::id(), &request.item_id),
            memory_mb: self.config.memory_mb,
            cpus: self.config.cpus,
            image: self.config.image.clone(),
            mount_source: request.workdir.clone(),
            mount_target: self.config.mount_target.clone(),
        };

        // Armed before launch: a half-created VM is still deleted.
        let _teardown = Teardown {
            provider: Arc::clone(&self.provider),
            name: spec.name.clone(),
        };
        let _cleanup = {
            let provider = Arc::clone(&self.provider);
            let name = spec.name.clone();
            interrupt.register_cleanup(format!("delete vm {name}"), move || {
                provider
                    .delete(&name)
                    .map_err(|err| anyhow!("delete vm {name}: {err}"))
            })
        };
        info!(vm = %spec.name, memory_mb = spec.memory_mb, cpus = spec.cpus, "launching vm");
        self.provider.launch(&spec)?;

        let launcher = VmLauncher {
            provider: self.provider.as_ref(),
            name: &spec.name,
            mount_target: &self.config.mount_target,
        };
        Ok(self.agent.invoke(request, &launcher, interrupt.flag())?)
    }

    fn check(&self) -> Result<(), BackendError> {
        self.provider.check_available()?;
        self.provider.list().map(|_| ())
    }

    fn list_orphans(&self, now: DateTime<Utc>) -> Result<Vec<OrphanResource>, BackendError> {
        let min_age = Duration::from_secs(self.config.orphan_min_age_secs);
        let max_age = Duration::from_secs(self.config.orphan_max_age_secs);
        let mut orphans = Vec::new();
        for vm in self.provider.list()? {
            let Some((created, pid)) = parse_vm_name(&vm.name) else {
                continue;
            };
            let age = (now - created).to_std().unwrap_or_default();
            if let Some(reason) = orphan_reason(age, pid_alive(pid), vm.is_running(), min_age, max_age) {
                debug!(vm = %vm.name, %reason, "orphaned vm");
                orphans.push(OrphanResource {
                    name: vm.name,
                    age_secs: age.as_secs(),
                    owner_pid: Some(pid),
                    reason,
                });
            }
        }
        Ok(orphans)
    }

    fn terminate(&self, name: &str) -> Result<(), BackendError> {
        if parse_vm_name(name).is_none() {
            return Err(BackendError::Command(anyhow!(
                "refusing to terminate '{name}': not a shipyard vm"
            )));
        }
        self.provider.delete(name)
    }
}

/// `multipass`-style CLI provider.
#[derive(Debug, Clone)]
pub struct CliVmProvider {
    binary: String,
}

impl CliVmProvider {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, BackendError> {
        let program = which::which(&self.binary).map_err(|_| BackendError::BinaryMissing {
            binary: self.binary.clone(),
        })?;
        debug!(?args, "running vm provider");
        let mut cmd = Command::new(program);
        cmd.args(args);
        let output = run_command_with_timeout(cmd, None, PROVIDER_TIMEOUT, PROVIDER_OUTPUT_LIMIT)
            .with_context(|| format!("run {} {}", self.binary, args.join(" ")))?;
        if output.status.success() && !output.timed_out {
            return Ok(output.stdout_lossy());
        }
        let stderr = output.stderr_lossy();
        let message = format!(
            "{} {} failed: {}",
            self.binary,
            args.first().copied().unwrap_or(""),
            stderr.trim()
        );
        Err(classify_provider_error(&stderr, message))
    }
}

fn classify_provider_error(stderr: &str, message: String) -> BackendError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("authenticate") || lower.contains("not authorized") {
        BackendError::AuthMissing { message }
    } else if lower.contains("cannot connect") || lower.contains("socket") {
        BackendError::Unreachable { message }
    } else {
        BackendError::Command(anyhow!(message))
    }
}

#[derive(Debug, Deserialize)]
struct ListOutput {
    list: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    name: String,
    state: String,
}

/// Parse `list --format json` output.
pub fn parse_list(raw: &str) -> anyhow::Result<Vec<VmInstance>> {
    let parsed: ListOutput = serde_json::from_str(raw).context("parse vm list output")?;
    Ok(parsed
        .list
        .into_iter()
        .map(|entry| VmInstance {
            name: entry.name,
            state: entry.state,
        })
        .collect())
}

impl VmProvider for CliVmProvider {
    fn check_available(&self) -> Result<(), BackendError> {
        self.run(&["version"]).map(|_| ())
    }

    #[instrument(skip_all, fields(vm = %spec.name))]
    fn launch(&self, spec: &VmSpec) -> Result<(), BackendError> {
        let memory = format!("{}M", spec.memory_mb);
        let cpus = spec.cpus.to_string();
        let mount = format!("{}:{}", spec.mount_source.display(), spec.mount_target);
        let mut args = vec![
            "launch", "--name", &spec.name, "--memory", &memory, "--cpus", &cpus, "--mount", &mount,
        ];
        if let Some(image) = &spec.image {
            args.push(image);
        }
        self.run(&args).map(|_| ()).map_err(|err| match err {
            BackendError::Command(inner) => BackendError::Provisioning {
                name: spec.name.clone(),
                message: format!("{inner:#}"),
            },
            other => other,
        })
    }

    fn exec_command(&self, name: &str, workdir: &str, program: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("exec")
            .arg(name)
            .arg("--working-directory")
            .arg(workdir)
            .arg("--")
            .arg(program)
            .args(args);
        cmd
    }

    fn delete(&self, name: &str) -> Result<(), BackendError> {
        match self.run(&["delete", "--purge", name]) {
            Ok(_) => Ok(()),
            Err(BackendError::Command(err)) if format!("{err:#}").contains("does not exist") => {
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn list(&self) -> Result<Vec<VmInstance>, BackendError> {
        let raw = self.run(&["list", "--format", "json"])?;
        Ok(parse_list(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn name_round_trips_time_and_pid() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("time");
        let name = vm_name(now, 4242, "007-fix-login");
        assert_eq!(name, format!("shipyard-{}-4242-007-fix-login", now.timestamp()));
        assert_eq!(parse_vm_name(&name), Some((now, 4242)));
        assert_eq!(parse_vm_name("other-vm"), None);
    }

    #[test]
    fn long_item_ids_are_truncated() {
        let name = vm_name(Utc::now(), 1, &format!("001-{}", "a".repeat(80)));
        assert!(name.len() <= MAX_VM_NAME);
    }

    /// Young VMs are never orphans; dead owners and overlong runs are.
    #[test]
    fn orphan_rules() {
        let min = Duration::from_secs(300);
        let max = Duration::from_secs(3600);
        let young = Duration::from_secs(10);
        let mid = Duration::from_secs(600);
        let old = Duration::from_secs(7200);
        assert_eq!(orphan_reason(young, false, true, min, max), None);
        assert!(orphan_reason(mid, false, false, min, max).is_some());
        assert_eq!(orphan_reason(mid, true, true, min, max), None);
        assert!(orphan_reason(old, true, true, min, max).is_some());
        assert_eq!(orphan_reason(old, true, false, min, max), None);
    }

    #[test]
    fn list_output_parses() {
        let raw = r#"{"list":[{"ipv4":[],"name":"shipyard-1-2-001-a","release":"24.04","state":"Running"}]}"#;
        let vms = parse_list(raw).expect("parse");
        assert_eq!(vms.len(), 1);
        assert!(vms[0].is_running());
    }

    #[test]
    fn auth_errors_are_classified() {
        let err = classify_provider_error("Please authenticate first", "x".to_string());
        assert!(matches!(err, BackendError::AuthMissing { .. }));
    }
}
