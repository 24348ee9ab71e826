//! Compute backends: where an agent invocation actually runs.

pub mod local;
pub mod vm;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::agent::{Agent, AgentRequest, AgentResult};
use crate::interrupt::Interrupt;
use crate::io::config::{ComputeKind, Config};

pub use local::LocalBackend;
pub use vm::{CliVmProvider, VmBackend, VmProvider};

/// Backend failures, kept apart from agent-logic failures.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend binary '{binary}' not found on PATH")]
    BinaryMissing { binary: String },
    #[error("backend is not authenticated: {message}")]
    AuthMissing { message: String },
    #[error("failed to provision {name}: {message}")]
    Provisioning { name: String, message: String },
    #[error("backend unreachable: {message}")]
    Unreachable { message: String },
    #[error(transparent)]
    Command(#[from] anyhow::Error),
}

/// A resource the backend considers abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanResource {
    pub name: String,
    pub age_secs: u64,
    pub owner_pid: Option<u32>,
    pub reason: String,
}

pub trait ComputeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the agent for one phase invocation. Any resource provisioned for
    /// the call is released before this returns, on success and failure.
    fn execute(
        &self,
        request: &AgentRequest,
        interrupt: &Interrupt,
    ) -> Result<AgentResult, BackendError>;

    /// Reachability probe for diagnostics.
    fn check(&self) -> Result<(), BackendError>;

    fn list_orphans(&self, now: DateTime<Utc>) -> Result<Vec<OrphanResource>, BackendError>;

    /// Forcibly release a named resource.
    fn terminate(&self, name: &str) -> Result<(), BackendError>;
}

/// Backend selected by `[compute]` configuration.
pub fn backend_from_config(config: &Config, agent: Arc<dyn Agent>) -> Box<dyn ComputeBackend> {
    match config.compute.kind {
        ComputeKind::Local => Box::new(LocalBackend::new(agent, &config.agent)),
        ComputeKind::Vm => Box::new(VmBackend::new(
            agent,
            Arc::new(CliVmProvider::new(&config.compute.binary)),
            config.compute.clone(),
        )),
    }
}
