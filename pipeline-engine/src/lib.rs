// Pipeline Engine Library
// DAG-based CI orchestration: matrix jobs, conditional gates, scoped services and secrets

pub mod config;
pub mod error;
pub mod execution;
pub mod expression;
pub mod model;
pub mod notify;
pub mod runners;
pub mod secrets;
pub mod services;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};

// Re-export model types
pub use model::{
    InstanceId, JobInstance, JobState, JobTemplate, MatrixPoint, ReadinessCheck, ServiceSpec,
    Shell, SkipReason, Step, Value,
};

// Re-export expression types
pub use expression::{Condition, GateEvaluator};

// Re-export execution types
pub use execution::{
    ExecutionEvent, JobGraph, JobOutcome, JobResult, MatrixExpander, ProgressSender,
    ResultAggregator, RunContext, RunOutcome, RunReport, Scheduler, TriggerInfo,
};

// Re-export runner, service and secret types
pub use notify::{GatedSink, NotificationSink, TracingSink};
pub use runners::{ShellStepRunner, StepRunner};
pub use secrets::{EnvSecretStore, SecretPropagator, SecretStore, StaticSecretStore};
pub use services::{ContainerServiceBackend, ServiceBackend, ServiceManager};
