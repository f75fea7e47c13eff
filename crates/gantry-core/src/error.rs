//! Error types for Gantry.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Build cause / material integrity
    #[error(
        "Build cause for pipeline [{pipeline}] does not match its configured materials: \
         expected fingerprints {expected:?}, got {actual:?}"
    )]
    MaterialMismatch {
        pipeline: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Pipeline [{pipeline}] cannot be scheduled with revision of material [{material}]: {reason}")]
    PipelineMaterialMismatch {
        pipeline: String,
        material: String,
        reason: String,
    },

    // Config lookups
    #[error("Stage '{stage}' not found in pipeline '{pipeline}'")]
    StageNotFound { pipeline: String, stage: String },

    #[error("Pipeline '{pipeline}' has no stages to schedule")]
    NoStages { pipeline: String },

    #[error("Job '{job}' not found in stage '{stage}'")]
    JobNotFound { stage: String, job: String },

    // Job type strategy
    #[error("Cannot rerun job '{job}'. {information}")]
    CannotRerunJob { job: String, information: String },

    #[error("Cannot schedule multiple instances of job named '{0}'.")]
    InvalidRerunSelection(String),

    #[error("Could not find matching agents to run job [{job}] of stage [{stage}].")]
    NoMatchingAgents { job: String, stage: String },

    #[error("Job '{0}' cannot be configured to both run on all agents and run multiple instances")]
    ConflictingJobRunConfig(String),

    #[error("Job '{0}' must be configured to run at least one instance")]
    InvalidRunInstanceCount(String),

    #[error("Elastic profile '{profile}' referenced by job '{job}' does not exist")]
    ElasticProfileNotFound { job: String, profile: String },

    // Builders
    #[error("No builder registered for task kind '{0}'")]
    UnknownTaskKind(String),

    #[error("Pipeline [{pipeline}] could not fetch artifact [{task}]. Unable to resolve revision for [{unresolved}] from build cause")]
    FetchAncestryUnresolved {
        pipeline: String,
        task: String,
        unresolved: String,
    },

    #[error("Pipeline [{pipeline}] tries to fetch artifact from job [{locator}] which is not a dependency material")]
    NotADependencyMaterial { pipeline: String, locator: String },

    #[error("Invalid dependency revision '{0}'")]
    InvalidDependencyRevision(String),

    // Infrastructure
    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Whether this error signals a broken or stale configuration snapshot.
    ///
    /// These are never retried; the scheduling attempt is abandoned.
    pub fn is_config_integrity(&self) -> bool {
        !matches!(
            self,
            Error::Remote(_) | Error::Io(_) | Error::Serialization(_) | Error::Internal(_)
        )
    }
}
