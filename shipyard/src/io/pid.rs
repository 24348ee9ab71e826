//! Process liveness and signalling by pid.

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};

fn refreshed(pid: u32) -> System {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    sys
}

/// True while `pid` names a running (non-zombie) process.
pub fn pid_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let sys = refreshed(pid);
    match sys.process(Pid::from_u32(pid)) {
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
        None => false,
    }
}

fn descendants(sys: &System, root: Pid) -> Vec<Pid> {
    let mut out = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in sys.processes() {
            if process.parent() == Some(parent) && !out.contains(pid) {
                out.push(*pid);
                frontier.push(*pid);
            }
        }
    }
    out
}

/// Send `signal` to `pid` and all of its descendants (children first).
/// Returns false if `pid` itself is already gone.
pub fn signal_tree(pid: u32, signal: Signal) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let root = Pid::from_u32(pid);
    if sys.process(root).is_none() {
        return false;
    }
    let mut targets = descendants(&sys, root);
    targets.reverse();
    targets.push(root);
    for target in targets {
        if let Some(process) = sys.process(target)
            && process.kill_with(signal).is_none()
        {
            process.kill();
        }
    }
    true
}
