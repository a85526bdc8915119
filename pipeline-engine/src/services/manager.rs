// Service Lifecycle Manager
// Acquires services with readiness gating and guarantees their release

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::{InstanceId, ServiceSpec};
use crate::services::{ServiceBackend, ServiceHandle};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Starts services for job instances and tracks the ones still alive
#[derive(Clone)]
pub struct ServiceManager {
    backend: Arc<dyn ServiceBackend>,
    start_timeout: Duration,
    poll_interval: Duration,
    live: Arc<Mutex<HashMap<String, ServiceHandle>>>,
}

impl ServiceManager {
    pub fn new(backend: Arc<dyn ServiceBackend>, config: &EngineConfig) -> Self {
        Self {
            backend,
            start_timeout: config.service_start_timeout(),
            poll_interval: config.readiness_poll_interval(),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn start_timeout(&self) -> Duration {
        self.start_timeout
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, ServiceHandle>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start a service for `owner` and wait until its readiness check passes.
    ///
    /// Fails with `ServiceStartTimeout` when the check does not pass within
    /// the configured timeout; the started service is released first.
    pub async fn acquire(&self, spec: &ServiceSpec, owner: &InstanceId) -> EngineResult<ServiceHandle> {
        self.acquire_until(spec, owner, &CancellationToken::new()).await
    }

    /// Like [`acquire`](Self::acquire), but stops waiting for readiness and
    /// releases the service when `cancel` fires
    pub async fn acquire_until(
        &self,
        spec: &ServiceSpec,
        owner: &InstanceId,
        cancel: &CancellationToken,
    ) -> EngineResult<ServiceHandle> {
        let handle = self.backend.start(spec, owner).await?;
        self.live().insert(handle.id.clone(), handle.clone());
        debug!(service = %spec.name, owner = %owner, id = %handle.id, "service started");

        let ready = tokio::select! {
            waited = tokio::time::timeout(self.start_timeout, self.wait_ready(&handle)) => Some(waited.is_ok()),
            _ = cancel.cancelled() => None,
        };

        match ready {
            Some(true) => {
                info!(service = %spec.name, owner = %owner, "service ready");
                Ok(handle)
            }
            Some(false) => {
                warn!(
                    service = %spec.name,
                    owner = %owner,
                    timeout = ?self.start_timeout,
                    "service did not become ready"
                );
                self.release(&handle).await;
                Err(EngineError::ServiceStartTimeout {
                    service: spec.name.clone(),
                    job: owner.to_string(),
                    timeout: self.start_timeout,
                })
            }
            None => {
                self.release(&handle).await;
                Err(EngineError::Cancelled)
            }
        }
    }

    async fn wait_ready(&self, handle: &ServiceHandle) {
        loop {
            match self.backend.is_ready(handle).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => debug!(service = %handle.name(), error = %e, "readiness probe failed"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Stop a service. Safe to call more than once for the same handle;
    /// backend errors are logged, never propagated.
    pub async fn release(&self, handle: &ServiceHandle) {
        let was_live = self.live().remove(&handle.id).is_some();
        if !was_live {
            return;
        }
        match self.backend.stop(handle).await {
            Ok(()) => debug!(service = %handle.name(), owner = %handle.owner, "service released"),
            Err(e) => warn!(
                service = %handle.name(),
                owner = %handle.owner,
                error = %e,
                "failed to stop service"
            ),
        }
    }

    /// Acquire every service of an instance, in order. If one fails, the
    /// services already started are released before the error is returned.
    pub async fn acquire_all(
        &self,
        specs: &[ServiceSpec],
        owner: &InstanceId,
        cancel: &CancellationToken,
    ) -> EngineResult<ServiceLease> {
        let mut lease = ServiceLease {
            manager: self.clone(),
            handles: Vec::with_capacity(specs.len()),
        };
        for spec in specs {
            match self.acquire_until(spec, owner, cancel).await {
                Ok(handle) => lease.handles.push(handle),
                Err(e) => {
                    lease.release().await;
                    return Err(e);
                }
            }
        }
        Ok(lease)
    }

    /// Release every live service owned by `owner`
    pub async fn release_owned(&self, owner: &InstanceId) {
        let owned: Vec<ServiceHandle> = self
            .live()
            .values()
            .filter(|h| &h.owner == owner)
            .cloned()
            .collect();
        for handle in owned {
            self.release(&handle).await;
        }
    }

    /// Services started and not yet released
    pub fn live_handles(&self) -> Vec<ServiceHandle> {
        let mut handles: Vec<_> = self.live().values().cloned().collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }
}

/// Services held by one job instance
pub struct ServiceLease {
    manager: ServiceManager,
    handles: Vec<ServiceHandle>,
}

impl ServiceLease {
    pub fn handles(&self) -> &[ServiceHandle] {
        &self.handles
    }

    /// Release all services, last acquired first
    pub async fn release(&mut self) {
        while let Some(handle) = self.handles.pop() {
            self.manager.release(&handle).await;
        }
    }
}
