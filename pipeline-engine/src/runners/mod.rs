// Runners Module
// Step runner interface used by the scheduler to execute a job instance's steps

pub mod shell;

pub use shell::ShellStepRunner;

use crate::execution::events::ProgressSender;
use crate::model::{InstanceId, Step};
use crate::secrets::JobEnvironment;
use crate::services::ServiceHandle;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors raised while executing steps. A non-zero exit status is not an
/// error; it is reported through [`StepOutcome::exit_status`].
#[derive(Debug, Error)]
pub enum StepError {
    #[error("failed to spawn step '{step}': {source}")]
    Spawn {
        step: String,
        #[source]
        source: std::io::Error,
    },

    #[error("step '{step}' timed out after {timeout:?}")]
    Timeout { step: String, timeout: Duration },

    #[error("job timed out after {0:?}")]
    JobTimeout(Duration),

    #[error("execution cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// A file produced by a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub name: String,
    pub path: PathBuf,
}

/// Everything a runner needs to execute one job instance
#[derive(Debug, Clone)]
pub struct JobDispatch {
    pub instance: InstanceId,
    pub template: String,
    pub steps: Vec<Step>,
    pub env: JobEnvironment,
    /// Services acquired for this instance, ready to use
    pub services: Vec<ServiceHandle>,
    /// Cancelled when the run is cancelled; checked between steps
    pub cancel: CancellationToken,
    pub progress: Option<ProgressSender>,
}

/// Result of executing all steps of a job instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub exit_status: i32,
    pub artifacts: Vec<ArtifactRef>,
    /// Structured output reported by the steps
    pub output: Option<serde_json::Value>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure(exit_status: i32) -> Self {
        Self {
            exit_status,
            ..Default::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_status == 0
    }
}

/// Executes the steps of a job instance
#[async_trait::async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, dispatch: JobDispatch) -> Result<StepOutcome, StepError>;
}
