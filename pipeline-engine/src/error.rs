// Engine Error Types
// Structural, runtime and engine-misuse failures raised by the orchestration core

use std::time::Duration;
use thiserror::Error;

use crate::runners::StepError;
use crate::services::ServiceError;

/// Result alias used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised by the pipeline engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// A job with the same name was already added to the graph
    #[error("duplicate job '{0}'")]
    DuplicateJob(String),

    /// A job name was referenced but never declared
    #[error("unknown job '{name}'{}", referenced_by.as_ref().map(|r| format!(" (referenced by '{}')", r)).unwrap_or_default())]
    UnknownJob {
        name: String,
        referenced_by: Option<String>,
    },

    /// The dependency relation contains a cycle
    #[error("circular dependency detected: {}", cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },

    /// A service did not pass its readiness check in time
    #[error("service '{service}' for job '{job}' not ready after {timeout:?}")]
    ServiceStartTimeout {
        service: String,
        job: String,
        timeout: Duration,
    },

    /// A condition referenced a field the evaluator does not know
    #[error("unknown predicate field '{0}'")]
    UnknownPredicateField(String),

    /// A second outcome was recorded for the same job instance
    #[error("result already recorded for job instance '{0}'")]
    DuplicateResult(String),

    /// The step runner failed to execute a job instance
    #[error("step execution failed for job '{job}': {source}")]
    StepExecution {
        job: String,
        #[source]
        source: StepError,
    },

    /// A declared secret was not available in the secret store
    #[error("secret '{secret}' required by job '{job}' is not available")]
    MissingSecret { job: String, secret: String },

    /// The service backend failed to start or stop a service
    #[error("service backend error: {0}")]
    Service(#[from] ServiceError),

    /// The run was cancelled before the operation completed
    #[error("run cancelled")]
    Cancelled,

    /// Invalid engine configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    pub fn unknown_job(name: impl Into<String>) -> Self {
        Self::UnknownJob {
            name: name.into(),
            referenced_by: None,
        }
    }

    pub fn unknown_job_referenced_by(name: impl Into<String>, by: impl Into<String>) -> Self {
        Self::UnknownJob {
            name: name.into(),
            referenced_by: Some(by.into()),
        }
    }

    /// Load-time errors that abort pipeline construction
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::DuplicateJob(_) | Self::UnknownJob { .. } | Self::Cycle { .. }
        )
    }

    /// Errors that indicate engine misuse and abort the whole run
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            Self::UnknownPredicateField(_) | Self::DuplicateResult(_)
        )
    }
}
