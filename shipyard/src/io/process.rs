//! Helpers for running child processes with timeouts, graceful termination
//! and bounded output.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use sysinfo::Signal;
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::pid::signal_tree;

/// How often the watcher wakes to check cancellation, the marker and the deadline.
const POLL_SLICE: Duration = Duration::from_millis(100);
/// Time a process gets to exit on its own after printing the completion marker.
const MARKER_EXIT_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    /// The completion marker appeared on stdout.
    pub marker_seen: bool,
    /// The cancellation flag was raised while the child ran.
    pub interrupted: bool,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Combined, labelled output suitable for a log file.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&self.stdout_lossy());
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&self.stderr_lossy());
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        buf.push_str(&format!(
            "\n=== exit: {:?} timed_out={} marker_seen={} interrupted={} ===\n",
            self.status.code(),
            self.timed_out,
            self.marker_seen,
            self.interrupted
        ));
        buf
    }
}

/// Knobs for [`run_watched`].
#[derive(Debug, Clone, Copy)]
pub struct WatchOptions<'a> {
    pub timeout: Duration,
    /// Wait between the terminate request and a forced kill.
    pub kill_grace: Duration,
    /// Bytes of stdout/stderr kept in memory (the rest is drained and counted).
    pub output_limit_bytes: usize,
    /// Stop the child shortly after this string appears on stdout.
    pub completion_marker: Option<&'a str>,
    /// Cooperative cancellation flag (set by the interrupt handler).
    pub cancel: Option<&'a AtomicBool>,
    /// Tee stdout lines to this file as they arrive.
    pub stream_path: Option<&'a Path>,
}

impl WatchOptions<'_> {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            timeout,
            kill_grace: Duration::from_secs(5),
            output_limit_bytes,
            completion_marker: None,
            cancel: None,
            stream_path: None,
        }
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    run_watched(cmd, stdin, WatchOptions::new(timeout, output_limit_bytes))
}

/// Run a command, watching for the completion marker, cancellation and the deadline.
///
/// Output is read concurrently while the child runs. On timeout or cancellation
/// the child is asked to terminate, then killed after `kill_grace`.
#[instrument(skip_all, fields(timeout_secs = opts.timeout.as_secs(), output_limit_bytes = opts.output_limit_bytes, streaming = opts.stream_path.is_some()))]
pub fn run_watched(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    opts: WatchOptions<'_>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let stream_file = match opts.stream_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stream dir {}", parent.display()))?;
            }
            let file = std::fs::File::create(path)
                .with_context(|| format!("create stream file {}", path.display()))?;
            Some(Mutex::new(std::io::BufWriter::new(file)))
        }
        None => None,
    };

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // A child that never reads stdin must not block the watcher.
            Some(thread::spawn(move || {
                let _ = child_stdin.write_all(&input);
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let marker_flag = Arc::new(AtomicBool::new(false));
    let stream_file = Arc::new(stream_file);
    let stdout_handle = {
        let marker = opts.completion_marker.map(str::to_string);
        let marker_flag = Arc::clone(&marker_flag);
        let stream_file = Arc::clone(&stream_file);
        let limit = opts.output_limit_bytes;
        thread::spawn(move || read_lines_watching(stdout, limit, marker, marker_flag, stream_file))
    };
    let limit = opts.output_limit_bytes;
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let started = Instant::now();
    let mut timed_out = false;
    let mut interrupted = false;
    let mut marker_at: Option<Instant> = None;
    let status = loop {
        if let Some(status) = child.wait_timeout(POLL_SLICE).context("wait for command")? {
            break status;
        }
        if opts.cancel.is_some_and(|flag| flag.load(Ordering::SeqCst)) {
            warn!("cancellation requested, terminating child");
            interrupted = true;
            break terminate(&mut child, opts.kill_grace)?;
        }
        if marker_flag.load(Ordering::SeqCst) {
            let seen = *marker_at.get_or_insert_with(Instant::now);
            if seen.elapsed() >= MARKER_EXIT_GRACE {
                debug!("completion marker seen, stopping child");
                break terminate(&mut child, opts.kill_grace)?;
            }
        }
        if started.elapsed() >= opts.timeout {
            warn!(
                timeout_secs = opts.timeout.as_secs(),
                "command timed out, terminating"
            );
            timed_out = true;
            break terminate(&mut child, opts.kill_grace)?;
        }
    };

    if let Some(handle) = stdin_handle {
        let _ = handle.join();
    }
    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    let marker_seen = marker_flag.load(Ordering::SeqCst);
    debug!(exit_code = ?status.code(), timed_out, marker_seen, interrupted, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        marker_seen,
        interrupted,
    })
}

/// Ask the child (and anything it spawned) to stop, then force it after `grace`.
fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus> {
    if signal_tree(child.id(), Signal::Term)
        && let Some(status) = child
            .wait_timeout(grace)
            .context("wait for graceful exit")?
    {
        return Ok(status);
    }
    warn!(pid = child.id(), "child ignored terminate request, killing");
    signal_tree(child.id(), Signal::Kill);
    // The child may have exited between the checks; kill then errors with InvalidInput.
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill after grace failed");
    }
    child.wait().context("wait command after kill")
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

type StreamFile = Arc<Option<Mutex<std::io::BufWriter<std::fs::File>>>>;

/// Read stdout line by line: tee, detect the marker, keep up to `limit` bytes.
fn read_lines_watching<R: Read>(
    reader: R,
    limit: usize,
    marker: Option<String>,
    marker_flag: Arc<AtomicBool>,
    stream_file: StreamFile,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(ref mutex) = *stream_file
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        if let Some(marker) = marker.as_deref()
            && String::from_utf8_lossy(&line).contains(marker)
        {
            marker_flag.store(true, Ordering::SeqCst);
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_output_and_stdin() {
        let out = run_command_with_timeout(sh("cat; echo err >&2"), Some(b"hello"), Duration::from_secs(10), 1024)
            .expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout, b"hello");
        assert_eq!(out.stderr_lossy().trim(), "err");
    }

    #[test]
    fn truncates_beyond_limit() {
        let out = run_command_with_timeout(sh("printf 0123456789"), None, Duration::from_secs(10), 4)
            .expect("run");
        assert_eq!(out.stdout, b"0123");
        assert_eq!(out.stdout_truncated, 6);
    }

    /// A hung child is terminated at the deadline instead of running forever.
    #[test]
    fn timeout_terminates_child() {
        let started = Instant::now();
        let mut opts = WatchOptions::new(Duration::from_millis(300), 1024);
        opts.kill_grace = Duration::from_secs(1);
        let out = run_watched(sh("exec sleep 30"), None, opts).expect("run");
        assert!(out.timed_out);
        assert!(!out.status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn marker_stops_lingering_child() {
        let mut opts = WatchOptions::new(Duration::from_secs(30), 1024);
        opts.completion_marker = Some("<done/>");
        opts.kill_grace = Duration::from_secs(1);
        let out = run_watched(sh("echo working; echo '<done/>'; exec sleep 30"), None, opts).expect("run");
        assert!(out.marker_seen);
        assert!(!out.timed_out);
    }

    #[test]
    fn cancel_flag_interrupts() {
        let flag = AtomicBool::new(true);
        let mut opts = WatchOptions::new(Duration::from_secs(30), 1024);
        opts.cancel = Some(&flag);
        opts.kill_grace = Duration::from_secs(1);
        let out = run_watched(sh("exec sleep 30"), None, opts).expect("run");
        assert!(out.interrupted);
    }

    #[test]
    fn stream_file_receives_lines() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("logs").join("agent.log");
        let mut opts = WatchOptions::new(Duration::from_secs(10), 1024);
        opts.stream_path = Some(&log);
        run_watched(sh("echo one; echo two"), None, opts).expect("run");
        assert_eq!(std::fs::read_to_string(&log).expect("read"), "one\ntwo\n");
    }
}
