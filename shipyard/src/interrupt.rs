//! Top-level cancellation: an interrupted flag plus cleanup that must run on the way out.
//!
//! The flag is set from the signal handler (no allocation, no locking there).
//! Cleanups run later on the main thread via [`Interrupt::run_cleanups`], each
//! bounded by a timeout so a wedged teardown never blocks exit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{debug, info, warn};

type Cleanup = Box<dyn FnOnce() -> Result<()> + Send>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    entries: Mutex<BTreeMap<u64, (String, Cleanup)>>,
}

/// Cloneable handle shared by the CLI, phases, and compute backends.
#[derive(Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("set", &self.is_set())
            .field("pending_cleanups", &self.pending_cleanups())
            .finish()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route SIGINT and SIGTERM to the flag.
    pub fn install(&self) -> Result<()> {
        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.flag))
                .with_context(|| format!("register handler for signal {signal}"))?;
        }
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Raw flag for subprocess watchers.
    pub fn flag(&self) -> &AtomicBool {
        &self.flag
    }

    /// Register `cleanup` to run if the process is interrupted before the guard is dropped.
    ///
    /// Dropping the returned guard deregisters the cleanup without running it.
    pub fn register_cleanup<F>(&self, label: impl Into<String>, cleanup: F) -> CleanupGuard
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        let label = label.into();
        debug!(id, %label, "cleanup registered");
        if let Ok(mut entries) = self.registry.entries.lock() {
            entries.insert(id, (label, Box::new(cleanup)));
        }
        CleanupGuard {
            id,
            registry: Arc::clone(&self.registry),
        }
    }

    pub fn pending_cleanups(&self) -> usize {
        self.registry
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Run every registered cleanup, each bounded by `timeout`.
    ///
    /// Returns how many completed successfully. Failures and timeouts are logged only.
    pub fn run_cleanups(&self, timeout: Duration) -> usize {
        let drained: Vec<(u64, (String, Cleanup))> = match self.registry.entries.lock() {
            Ok(mut entries) => std::mem::take(&mut *entries).into_iter().collect(),
            Err(_) => return 0,
        };
        let mut succeeded = 0;
        for (id, (label, cleanup)) in drained {
            let (tx, rx) = mpsc::channel();
            thread::spawn(move || {
                let _ = tx.send(cleanup());
            });
            match rx.recv_timeout(timeout) {
                Ok(Ok(())) => {
                    info!(id, %label, "cleanup finished");
                    succeeded += 1;
                }
                Ok(Err(err)) => warn!(id, %label, err = %format!("{err:#}"), "cleanup failed"),
                Err(_) => warn!(id, %label, timeout_ms = timeout.as_millis() as u64, "cleanup timed out"),
            }
        }
        succeeded
    }
}

/// Deregisters its cleanup on drop.
pub struct CleanupGuard {
    id: u64,
    registry: Arc<Registry>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Ok(mut entries) = self.registry.entries.lock() {
            entries.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dropped_guard_deregisters() {
        let interrupt = Interrupt::new();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            let _guard = interrupt.register_cleanup("vm", move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            assert_eq!(interrupt.pending_cleanups(), 1);
        }
        assert_eq!(interrupt.pending_cleanups(), 0);
        assert_eq!(interrupt.run_cleanups(Duration::from_secs(1)), 0);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    /// A hung or failing cleanup does not stop the others and never blocks past the bound.
    #[test]
    fn cleanups_are_bounded_and_isolated() {
        let interrupt = Interrupt::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let hang = interrupt.register_cleanup("hang", || {
            thread::sleep(Duration::from_secs(30));
            Ok(())
        });
        let fail = interrupt.register_cleanup("fail", || Err(anyhow!("boom")));
        let counted = {
            let ran = Arc::clone(&ran);
            interrupt.register_cleanup("ok", move || {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        interrupt.trigger();
        assert!(interrupt.is_set());

        let started = std::time::Instant::now();
        assert_eq!(interrupt.run_cleanups(Duration::from_millis(200)), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        drop((hang, fail, counted));
    }
}
