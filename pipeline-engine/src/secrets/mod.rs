// Secrets Module
// Secret store abstraction and per-instance environment binding

pub mod propagator;

pub use propagator::{JobEnvironment, SecretPropagator};

use std::collections::HashMap;
use std::fmt;

/// A secret value. `Debug` and `Display` never reveal the contents.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the plain value
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Source of credentials. Implementations are queried once per instance.
#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a secret by name; `None` when the store does not hold it
    async fn fetch(&self, name: &str) -> Option<SecretValue>;
}

/// Reads secrets from the process environment, optionally under a prefix
#[derive(Debug, Clone, Default)]
pub struct EnvSecretStore {
    prefix: String,
}

impl EnvSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `<prefix><name>` instead of `<name>`
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait::async_trait]
impl SecretStore for EnvSecretStore {
    async fn fetch(&self, name: &str) -> Option<SecretValue> {
        std::env::var(format!("{}{}", self.prefix, name))
            .ok()
            .map(SecretValue::new)
    }
}

/// Fixed in-memory secrets
#[derive(Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, SecretValue>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(name.into(), SecretValue::new(value));
        self
    }
}

impl fmt::Debug for StaticSecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.secrets.keys().collect();
        names.sort();
        f.debug_struct("StaticSecretStore")
            .field("names", &names)
            .finish()
    }
}

#[async_trait::async_trait]
impl SecretStore for StaticSecretStore {
    async fn fetch(&self, name: &str) -> Option<SecretValue> {
        self.secrets.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_value_redacted() {
        let secret = SecretValue::new("hunter2");
        assert_eq!(format!("{:?}", secret), "SecretValue(***)");
        assert_eq!(secret.to_string(), "***");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[tokio::test]
    async fn test_static_store() {
        let store = StaticSecretStore::new().with_secret("pypi", "tok-123");
        assert_eq!(
            store.fetch("pypi").await.map(|s| s.expose().to_string()),
            Some("tok-123".to_string())
        );
        assert!(store.fetch("npm").await.is_none());
        assert!(!format!("{:?}", store).contains("tok-123"));
    }

    #[tokio::test]
    async fn test_env_store_prefix() {
        std::env::set_var("PIPELINE_ENGINE_TEST_SECRET_TOKEN", "abc");
        let store = EnvSecretStore::with_prefix("PIPELINE_ENGINE_TEST_SECRET_");
        assert_eq!(
            store.fetch("TOKEN").await.map(|s| s.expose().to_string()),
            Some("abc".to_string())
        );
        assert!(store.fetch("MISSING").await.is_none());
    }
}
