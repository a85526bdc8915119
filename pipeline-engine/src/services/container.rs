// Container Service Backend
// Runs job services as detached Docker containers through the docker CLI

use crate::model::{InstanceId, ReadinessCheck, ServiceSpec};
use crate::services::{ServiceBackend, ServiceError, ServiceHandle};

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command;

/// Image pull policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImagePullPolicy {
    /// Always pull the image
    Always,
    /// Pull only if not present locally
    #[default]
    IfNotPresent,
    /// Never pull (must be present locally)
    Never,
}

/// Configuration for the container backend
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub pull_policy: ImagePullPolicy,
    /// Host used for TCP readiness probes
    pub probe_host: String,
    /// Connect timeout of a single TCP probe
    pub probe_timeout: Duration,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            pull_policy: ImagePullPolicy::default(),
            probe_host: "127.0.0.1".to_string(),
            probe_timeout: Duration::from_secs(1),
        }
    }
}

/// Service backend starting one container per service per job instance
#[derive(Debug, Clone, Default)]
pub struct ContainerServiceBackend {
    config: ContainerConfig,
}

impl ContainerServiceBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ContainerConfig) -> Self {
        Self { config }
    }

    /// Check if Docker is available
    pub async fn is_available(&self) -> bool {
        Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Pull an image if needed based on pull policy
    async fn pull_image_if_needed(&self, spec: &ServiceSpec) -> Result<(), ServiceError> {
        let present = match self.config.pull_policy {
            ImagePullPolicy::Never => return Ok(()),
            ImagePullPolicy::Always => false,
            ImagePullPolicy::IfNotPresent => docker(&["image", "inspect", &spec.image])
                .await?
                .status
                .success(),
        };
        if present {
            return Ok(());
        }

        let output = docker(&["pull", &spec.image]).await?;
        if !output.status.success() {
            return Err(ServiceError::StartFailed {
                service: spec.name.clone(),
                message: format!(
                    "failed to pull {}: {}",
                    spec.image,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

async fn docker(args: &[&str]) -> Result<std::process::Output, ServiceError> {
    Command::new("docker")
        .args(args)
        .output()
        .await
        .map_err(|e| ServiceError::BackendUnavailable(e.to_string()))
}

/// `docker run -d` arguments for a service owned by `owner`
fn run_args(spec: &ServiceSpec, container_name: &str, owner: &InstanceId) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name.to_string(),
        "--label".to_string(),
        format!("pipeline.instance={}", owner),
    ];

    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    for port in &spec.ports {
        args.push("-p".to_string());
        args.push(format!("{}:{}", port.host, port.container));
    }

    args.push(spec.image.clone());
    args
}

/// Container names must be unique per instance: `pipeline-svc-<service>-<suffix>`
fn container_name(service: &str) -> String {
    let service: String = service
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("pipeline-svc-{}-{}", service, unique_suffix())
}

/// Short hex suffix from the clock, the process id and a counter
fn unique_suffix() -> String {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:08x}{:04x}", nanos ^ std::process::id(), seq & 0xffff)
}

#[async_trait::async_trait]
impl ServiceBackend for ContainerServiceBackend {
    async fn start(&self, spec: &ServiceSpec, owner: &InstanceId) -> Result<ServiceHandle, ServiceError> {
        self.pull_image_if_needed(spec).await?;

        let name = container_name(&spec.name);
        let args = run_args(spec, &name, owner);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = docker(&args).await?;

        if !output.status.success() {
            return Err(ServiceError::StartFailed {
                service: spec.name.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(ServiceHandle {
            id: name,
            spec: spec.clone(),
            owner: owner.clone(),
        })
    }

    async fn is_ready(&self, handle: &ServiceHandle) -> Result<bool, ServiceError> {
        match &handle.spec.readiness {
            ReadinessCheck::None => Ok(true),
            ReadinessCheck::Tcp { port } => {
                let addr = (self.config.probe_host.as_str(), *port);
                let connect = tokio::time::timeout(self.config.probe_timeout, TcpStream::connect(addr));
                Ok(matches!(connect.await, Ok(Ok(_))))
            }
            ReadinessCheck::Command { command } => {
                let mut args = vec!["exec", handle.id.as_str()];
                args.extend(command.iter().map(String::as_str));
                let output = docker(&args).await.map_err(|e| ServiceError::ProbeFailed {
                    service: handle.spec.name.clone(),
                    message: e.to_string(),
                })?;
                Ok(output.status.success())
            }
        }
    }

    async fn stop(&self, handle: &ServiceHandle) -> Result<(), ServiceError> {
        let output = docker(&["rm", "-f", &handle.id]).await?;
        if !output.status.success() {
            return Err(ServiceError::StopFailed {
                service: handle.spec.name.clone(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_run_args() {
        let spec = ServiceSpec::new("mongo", "mongo:4.0")
            .port(27017, 27017)
            .env("MONGO_INITDB_DATABASE", "test");
        let args = run_args(&spec, "pipeline-svc-mongo-1", &InstanceId::from("test[python=3.7]"));

        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "--name",
                "pipeline-svc-mongo-1",
                "--label",
                "pipeline.instance=test[python=3.7]",
                "-e",
                "MONGO_INITDB_DATABASE=test",
                "-p",
                "27017:27017",
                "mongo:4.0",
            ]
        );
    }

    #[test]
    fn test_container_names_unique() {
        let a = container_name("my_db");
        let b = container_name("my_db");
        assert!(a.starts_with("pipeline-svc-my-db-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_tcp_readiness() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let backend = ContainerServiceBackend::new();

        let handle = ServiceHandle {
            id: "unused".to_string(),
            spec: ServiceSpec::new("db", "db:1").readiness(ReadinessCheck::tcp(port)),
            owner: InstanceId::from("test"),
        };
        assert!(backend.is_ready(&handle).await.unwrap());

        drop(listener);
        assert!(!backend.is_ready(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_readiness_check_is_ready() {
        let backend = ContainerServiceBackend::new();
        let handle = ServiceHandle {
            id: "unused".to_string(),
            spec: ServiceSpec::new("cache", "redis:6"),
            owner: InstanceId::from("test"),
        };
        assert!(backend.is_ready(&handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_docker_availability_check() {
        // Only verifies the check doesn't panic
        let _ = ContainerServiceBackend::new().is_available().await;
    }
}
