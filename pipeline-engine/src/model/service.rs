// Service Specifications
// Auxiliary long-running services (databases, caches) scoped to a job instance

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A service started alongside a job instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSpec {
    /// Service name, unique within the job
    pub name: String,
    /// Image or backend-specific identifier
    pub image: String,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub readiness: ReadinessCheck,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Host port published for a service port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Probe confirming that a service is usable
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReadinessCheck {
    /// Ready as soon as the backend reports it started
    #[default]
    None,
    /// A TCP connection to the host port succeeds
    Tcp { port: u16 },
    /// A command run inside the service exits successfully
    Command { command: Vec<String> },
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ports: Vec::new(),
            readiness: ReadinessCheck::None,
            env: BTreeMap::new(),
        }
    }

    pub fn port(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortMapping { host, container });
        self
    }

    pub fn readiness(mut self, check: ReadinessCheck) -> Self {
        self.readiness = check;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl ReadinessCheck {
    pub fn tcp(port: u16) -> Self {
        Self::Tcp { port }
    }

    pub fn command<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Command {
            command: args.into_iter().map(Into::into).collect(),
        }
    }
}
