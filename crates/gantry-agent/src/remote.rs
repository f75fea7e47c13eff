//! Agent to server reporting contract.

use crate::error::RemoteError;
use async_trait::async_trait;
use gantry_core::ids::{AgentId, JobIdentifier};
use gantry_core::instance::{JobResult, JobState};
use serde::{Deserialize, Serialize};

/// Who is reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub uuid: AgentId,
    pub hostname: String,
}

impl AgentIdentity {
    pub fn new(uuid: AgentId, hostname: impl Into<String>) -> Self {
        Self {
            uuid,
            hostname: hostname.into(),
        }
    }
}

/// Server reply to a ping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInstruction {
    pub should_cancel: bool,
}

impl AgentInstruction {
    pub fn cancel() -> Self {
        Self { should_cancel: true }
    }
}

/// Build progress reports.
///
/// Failures are returned to the caller as [`RemoteError`]; retry and backoff
/// are the caller's decision.
#[async_trait]
pub trait BuildRepositoryRemote: Send + Sync {
    async fn report_current_status(
        &self,
        agent: &AgentIdentity,
        job: &JobIdentifier,
        state: JobState,
    ) -> Result<(), RemoteError>;

    async fn report_completing(
        &self,
        agent: &AgentIdentity,
        job: &JobIdentifier,
        result: JobResult,
    ) -> Result<(), RemoteError>;

    async fn report_completed(
        &self,
        agent: &AgentIdentity,
        job: &JobIdentifier,
        result: JobResult,
    ) -> Result<(), RemoteError>;

    async fn ping(&self, agent: &AgentIdentity) -> Result<AgentInstruction, RemoteError>;
}

/// Sink for job properties and error reports.
#[async_trait]
pub trait PropertyPublisher: Send + Sync {
    async fn set_property(&self, job: &JobIdentifier, name: &str, value: &str) -> Result<(), RemoteError>;

    async fn report_error_message(&self, job: &JobIdentifier, message: &str, cause: &str) -> Result<(), RemoteError>;
}
