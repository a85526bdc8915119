// Services Module
// Lifecycle management for auxiliary services scoped to a job instance

pub mod container;
pub mod manager;

pub use container::ContainerServiceBackend;
pub use manager::{ServiceLease, ServiceManager};

use crate::model::{InstanceId, ServiceSpec};

use thiserror::Error;

/// Errors reported by a service backend
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service backend is not available: {0}")]
    BackendUnavailable(String),

    #[error("failed to start service '{service}': {message}")]
    StartFailed { service: String, message: String },

    #[error("readiness probe for service '{service}' failed: {message}")]
    ProbeFailed { service: String, message: String },

    #[error("failed to stop service '{service}': {message}")]
    StopFailed { service: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A started service owned by exactly one job instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHandle {
    /// Backend identifier (container id, process id, ...)
    pub id: String,
    pub spec: ServiceSpec,
    pub owner: InstanceId,
}

impl ServiceHandle {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

/// Starts, probes and stops services
#[async_trait::async_trait]
pub trait ServiceBackend: Send + Sync {
    async fn start(&self, spec: &ServiceSpec, owner: &InstanceId) -> Result<ServiceHandle, ServiceError>;

    /// Run the service's readiness check once
    async fn is_ready(&self, handle: &ServiceHandle) -> Result<bool, ServiceError>;

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), ServiceError>;
}
