//! Quality-gate and acceptance-verification commands.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::process::run_command_with_timeout;

#[derive(Debug, Clone)]
pub struct GateRequest {
    pub workdir: PathBuf,
    /// argv; first element is the program.
    pub command: Vec<String>,
    pub log_path: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    Fail { exit_code: Option<i32>, timed_out: bool },
}

impl GateOutcome {
    pub fn passed(&self) -> bool {
        *self == GateOutcome::Pass
    }
}

/// Runs one gate command. Tests substitute scripted runners.
pub trait GateRunner: Send + Sync {
    fn run(&self, request: &GateRequest) -> Result<GateOutcome>;
}

/// Spawns the configured argv.
pub struct CommandGateRunner;

impl GateRunner for CommandGateRunner {
    #[instrument(skip_all, fields(program = request.command.first().map(String::as_str).unwrap_or("")))]
    fn run(&self, request: &GateRequest) -> Result<GateOutcome> {
        let (program, args) = request
            .command
            .split_first()
            .ok_or_else(|| anyhow!("gate command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let output = run_command_with_timeout(
            cmd,
            None,
            request.timeout,
            request.output_limit_bytes,
        )
        .with_context(|| format!("run gate {}", request.command.join(" ")))?;
        write_gate_log(&request.log_path, &output.render_log("gate"))?;

        if output.status.success() && !output.timed_out {
            info!("gate passed");
            Ok(GateOutcome::Pass)
        } else {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "gate failed");
            Ok(GateOutcome::Fail {
                exit_code: output.status.code(),
                timed_out: output.timed_out,
            })
        }
    }
}

/// Run every gate in order, stopping at the first failure.
///
/// Returns the failing command and its outcome, or `None` if all passed.
pub fn run_gates<R: GateRunner + ?Sized>(
    runner: &R,
    commands: &[Vec<String>],
    workdir: &Path,
    log_dir: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<Option<(String, GateOutcome)>> {
    for (idx, command) in commands.iter().enumerate() {
        let request = GateRequest {
            workdir: workdir.to_path_buf(),
            command: command.clone(),
            log_path: log_dir.join(format!("gate-{idx}.log")),
            timeout,
            output_limit_bytes,
        };
        let outcome = runner.run(&request)?;
        if !outcome.passed() {
            return Ok(Some((command.join(" "), outcome)));
        }
    }
    Ok(None)
}

fn write_gate_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create gate log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write gate log {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedGates {
        outcomes: Mutex<Vec<GateOutcome>>,
        seen: Mutex<Vec<String>>,
    }

    impl GateRunner for ScriptedGates {
        fn run(&self, request: &GateRequest) -> Result<GateOutcome> {
            self.seen.lock().expect("seen").push(request.command.join(" "));
            Ok(self.outcomes.lock().expect("outcomes").remove(0))
        }
    }

    fn argv(s: &str) -> Vec<String> {
        s.split(' ').map(str::to_string).collect()
    }

    #[test]
    fn stops_at_first_failure() {
        let runner = ScriptedGates {
            outcomes: Mutex::new(vec![
                GateOutcome::Pass,
                GateOutcome::Fail {
                    exit_code: Some(2),
                    timed_out: false,
                },
                GateOutcome::Pass,
            ]),
            seen: Mutex::new(Vec::new()),
        };
        let temp = tempfile::tempdir().expect("tempdir");
        let failed = run_gates(
            &runner,
            &[argv("fmt check"), argv("lint all"), argv("test all")],
            temp.path(),
            temp.path(),
            Duration::from_secs(1),
            1024,
        )
        .expect("run");
        let (command, _) = failed.expect("a gate failed");
        assert_eq!(command, "lint all");
        assert_eq!(runner.seen.lock().expect("seen").len(), 2);
    }

    #[test]
    fn real_command_runner_writes_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = GateRequest {
            workdir: temp.path().to_path_buf(),
            command: vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
            log_path: temp.path().join("logs").join("gate.log"),
            timeout: Duration::from_secs(10),
            output_limit_bytes: 1024,
        };
        let outcome = CommandGateRunner.run(&request).expect("run");
        assert_eq!(
            outcome,
            GateOutcome::Fail {
                exit_code: Some(3),
                timed_out: false
            }
        );
        assert!(request.log_path.exists());
    }
}
