//! Host execution: the agent runs directly in the repository checkout.

use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use tracing::instrument;

use super::{BackendError, ComputeBackend, OrphanResource};
use crate::agent::{Agent, AgentRequest, AgentResult, HostLauncher};
use crate::interrupt::Interrupt;
use crate::io::config::{AgentConfig, AgentKind};

pub struct LocalBackend {
    agent: Arc<dyn Agent>,
    /// Program that must be on PATH; `None` for in-process agents.
    program: Option<String>,
}

impl LocalBackend {
    pub fn new(agent: Arc<dyn Agent>, config: &AgentConfig) -> Self {
        let program = (config.kind != AgentKind::Mock).then(|| config.command.clone());
        Self { agent, program }
    }
}

impl ComputeBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip_all, fields(backend = "local", item = %request.item_id, phase = %request.phase))]
    fn execute(
        &self,
        request: &AgentRequest,
        interrupt: &Interrupt,
    ) -> Result<AgentResult, BackendError> {
        if let Some(program) = &self.program
            && which::which(program).is_err()
        {
            return Err(BackendError::BinaryMissing {
                binary: program.clone(),
            });
        }
        Ok(self
            .agent
            .invoke(request, &HostLauncher, interrupt.flag())?)
    }

    fn check(&self) -> Result<(), BackendError> {
        match &self.program {
            Some(program) => which::which(program)
                .map(|_| ())
                .map_err(|_| BackendError::BinaryMissing {
                    binary: program.clone(),
                }),
            None => Ok(()),
        }
    }

    fn list_orphans(&self, _now: DateTime<Utc>) -> Result<Vec<OrphanResource>, BackendError> {
        Ok(Vec::new())
    }

    fn terminate(&self, name: &str) -> Result<(), BackendError> {
        Err(BackendError::Command(anyhow!(
            "local backend owns no resource named {name}"
        )))
    }
}
