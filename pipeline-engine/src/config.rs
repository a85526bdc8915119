// Engine Configuration
// Run-wide limits and timeouts, loadable from YAML

use crate::error::{EngineError, EngineResult};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default time a service may take to pass its readiness check
pub const DEFAULT_SERVICE_START_TIMEOUT_SECS: u64 = 60;

/// Default interval between readiness probes
pub const DEFAULT_READINESS_POLL_INTERVAL_MS: u64 = 500;

/// Configuration for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum job instances running at once across all templates (0 = available parallelism)
    pub max_concurrency: usize,
    /// Seconds a service may take to become ready
    pub service_start_timeout_secs: u64,
    /// Milliseconds between readiness probes
    pub readiness_poll_interval_ms: u64,
    /// Default wall-clock limit for a job instance, in seconds
    pub default_job_timeout_secs: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            service_start_timeout_secs: DEFAULT_SERVICE_START_TIMEOUT_SECS,
            readiness_poll_interval_ms: DEFAULT_READINESS_POLL_INTERVAL_MS,
            default_job_timeout_secs: None,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from YAML text
    pub fn from_yaml_str(text: &str) -> EngineResult<Self> {
        let config: Self =
            serde_yaml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.service_start_timeout_secs == 0 {
            return Err(EngineError::Config(
                "service_start_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.readiness_poll_interval_ms == 0 {
            return Err(EngineError::Config(
                "readiness_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective global concurrency ceiling
    pub fn concurrency_limit(&self) -> usize {
        if self.max_concurrency > 0 {
            return self.max_concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn service_start_timeout(&self) -> Duration {
        Duration::from_secs(self.service_start_timeout_secs)
    }

    pub fn readiness_poll_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_poll_interval_ms)
    }

    pub fn default_job_timeout(&self) -> Option<Duration> {
        self.default_job_timeout_secs.map(Duration::from_secs)
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_service_start_timeout(mut self, timeout: Duration) -> Self {
        self.service_start_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_readiness_poll_interval(mut self, interval: Duration) -> Self {
        self.readiness_poll_interval_ms = (interval.as_millis() as u64).max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.service_start_timeout(), Duration::from_secs(60));
        assert_eq!(config.readiness_poll_interval(), Duration::from_millis(500));
        assert!(config.default_job_timeout().is_none());
        assert!(config.concurrency_limit() >= 1);
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = EngineConfig::from_yaml_str("max_concurrency: 3\n").unwrap();
        assert_eq!(config.max_concurrency, 3);
        assert_eq!(config.concurrency_limit(), 3);
        assert_eq!(
            config.service_start_timeout_secs,
            DEFAULT_SERVICE_START_TIMEOUT_SECS
        );
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let err = EngineConfig::from_yaml_str("max_paralel: 3\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = EngineConfig::from_yaml_str("service_start_timeout_secs: 0\n").unwrap_err();
        assert!(err.to_string().contains("service_start_timeout_secs"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "readiness_poll_interval_ms: 50").unwrap();
        writeln!(file, "default_job_timeout_secs: 600").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.readiness_poll_interval(), Duration::from_millis(50));
        assert_eq!(config.default_job_timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/nonexistent/engine.yaml").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
