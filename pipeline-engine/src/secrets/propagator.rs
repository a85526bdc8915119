// Secret/Environment Propagator
// Builds a fresh, isolated environment mapping for each job instance

use crate::error::{EngineError, EngineResult};
use crate::model::{JobInstance, JobTemplate};
use crate::secrets::{SecretStore, SecretValue};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

const MASK: &str = "***";

/// Environment bound to exactly one job instance
#[derive(Clone, Default)]
pub struct JobEnvironment {
    vars: BTreeMap<String, String>,
    secrets: BTreeMap<String, SecretValue>,
}

impl JobEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.secrets.remove(&key);
        self.vars.insert(key, value.into());
    }

    pub fn set_secret(&mut self, key: impl Into<String>, value: SecretValue) {
        let key = key.into();
        self.vars.remove(&key);
        self.secrets.insert(key, value);
    }

    /// Plain value of a variable or secret
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .get(key)
            .map(String::as_str)
            .or_else(|| self.secrets.get(key).map(SecretValue::expose))
    }

    pub fn is_secret(&self, key: &str) -> bool {
        self.secrets.contains_key(key)
    }

    /// Flattened mapping handed to the step runner
    pub fn to_env_map(&self) -> HashMap<String, String> {
        self.vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .chain(
                self.secrets
                    .iter()
                    .map(|(k, v)| (k.clone(), v.expose().to_string())),
            )
            .collect()
    }

    /// Replace every secret value occurring in `text` with `***`
    pub fn mask(&self, text: &str) -> String {
        let mut values: Vec<&str> = self
            .secrets
            .values()
            .map(SecretValue::expose)
            .filter(|v| !v.is_empty())
            .collect();
        // longest first so overlapping secrets are fully covered
        values.sort_by_key(|v| std::cmp::Reverse(v.len()));

        let mut masked = text.to_string();
        for value in values {
            if masked.contains(value) {
                masked = masked.replace(value, MASK);
            }
        }
        masked
    }

    pub fn len(&self) -> usize {
        self.vars.len() + self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for JobEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secrets: BTreeMap<&str, &str> =
            self.secrets.keys().map(|k| (k.as_str(), MASK)).collect();
        f.debug_struct("JobEnvironment")
            .field("vars", &self.vars)
            .field("secrets", &secrets)
            .finish()
    }
}

/// Binds run, template, matrix and secret values into per-instance environments
#[derive(Clone)]
pub struct SecretPropagator {
    store: Arc<dyn SecretStore>,
}

impl SecretPropagator {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Build the environment for one instance.
    ///
    /// Later sources override earlier ones: run env, template env, matrix
    /// values as `MATRIX_<AXIS>`, engine variables (`PIPELINE_*`), then the
    /// template's declared secrets fetched from the store. Secrets are fetched
    /// on every call; nothing is cached across instances.
    pub async fn bind(
        &self,
        instance: &JobInstance,
        template: &JobTemplate,
        run_env: &BTreeMap<String, String>,
    ) -> EngineResult<JobEnvironment> {
        let mut env = JobEnvironment::new();

        for (k, v) in run_env.iter().chain(&template.env) {
            env.set(k.clone(), v.clone());
        }
        for (axis, value) in instance.matrix.iter() {
            env.set(matrix_var(axis), value.as_string());
        }
        env.set("PIPELINE_JOB", instance.template.clone());
        env.set("PIPELINE_INSTANCE", instance.id.to_string());

        for (var, secret_name) in &template.secrets {
            let value =
                self.store
                    .fetch(secret_name)
                    .await
                    .ok_or_else(|| EngineError::MissingSecret {
                        job: instance.id.to_string(),
                        secret: secret_name.clone(),
                    })?;
            env.set_secret(var.clone(), value);
        }

        Ok(env)
    }
}

/// `python-version` -> `MATRIX_PYTHON_VERSION`
fn matrix_var(axis: &str) -> String {
    let name: String = axis
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("MATRIX_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::matrix::MatrixExpander;
    use crate::model::MatrixPoint;
    use crate::secrets::StaticSecretStore;

    use std::sync::atomic::{AtomicUsize, Ordering};

    fn propagator() -> SecretPropagator {
        SecretPropagator::new(Arc::new(
            StaticSecretStore::new().with_secret("pypi", "pypi-token-xyz"),
        ))
    }

    #[tokio::test]
    async fn test_bind_layers() {
        let template = JobTemplate::new("test")
            .axis("python-version", ["3.7"])
            .env("CI", "template")
            .env("ONLY_TEMPLATE", "1");
        let instance = MatrixExpander::expand(&template).instances.remove(0);
        let run_env = BTreeMap::from([
            ("CI".to_string(), "run".to_string()),
            ("RUN_ID".to_string(), "42".to_string()),
        ]);

        let env = propagator().bind(&instance, &template, &run_env).await.unwrap();

        assert_eq!(env.get("CI"), Some("template"));
        assert_eq!(env.get("RUN_ID"), Some("42"));
        assert_eq!(env.get("MATRIX_PYTHON_VERSION"), Some("3.7"));
        assert_eq!(env.get("PIPELINE_JOB"), Some("test"));
        assert_eq!(env.get("PIPELINE_INSTANCE"), Some("test[python-version=3.7]"));
    }

    #[tokio::test]
    async fn test_secrets_bound_and_redacted() {
        let template = JobTemplate::new("release").secret("PYPI_TOKEN", "pypi");
        let instance = JobInstance::new("release", MatrixPoint::default());

        let env = propagator()
            .bind(&instance, &template, &BTreeMap::new())
            .await
            .unwrap();

        assert!(env.is_secret("PYPI_TOKEN"));
        assert_eq!(
            env.to_env_map().get("PYPI_TOKEN").map(String::as_str),
            Some("pypi-token-xyz")
        );
        let debug = format!("{:?}", env);
        assert!(debug.contains("PYPI_TOKEN"));
        assert!(!debug.contains("pypi-token-xyz"));
        assert_eq!(
            env.mask("uploading with pypi-token-xyz now"),
            "uploading with *** now"
        );
    }

    #[tokio::test]
    async fn test_secret_not_leaked_to_other_instances() {
        let release = JobTemplate::new("release").secret("PYPI_TOKEN", "pypi");
        let docs = JobTemplate::new("docs");
        let p = propagator();

        let release_env = p
            .bind(&JobInstance::new("release", MatrixPoint::default()), &release, &BTreeMap::new())
            .await
            .unwrap();
        let docs_env = p
            .bind(&JobInstance::new("docs", MatrixPoint::default()), &docs, &BTreeMap::new())
            .await
            .unwrap();

        assert!(release_env.get("PYPI_TOKEN").is_some());
        assert!(docs_env.get("PYPI_TOKEN").is_none());
        assert!(!docs_env
            .to_env_map()
            .values()
            .any(|v| v == "pypi-token-xyz"));
    }

    #[tokio::test]
    async fn test_missing_secret() {
        let template = JobTemplate::new("release").secret("NPM_TOKEN", "npm");
        let instance = JobInstance::new("release", MatrixPoint::default());
        let err = propagator()
            .bind(&instance, &template, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::MissingSecret { ref secret, .. } if secret == "npm"
        ));
    }

    struct CountingStore(AtomicUsize);

    #[async_trait::async_trait]
    impl SecretStore for CountingStore {
        async fn fetch(&self, _name: &str) -> Option<SecretValue> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Some(SecretValue::new(format!("rotated-{}", n)))
        }
    }

    #[tokio::test]
    async fn test_secrets_fetched_fresh_per_instance() {
        let p = SecretPropagator::new(Arc::new(CountingStore(AtomicUsize::new(0))));
        let template = JobTemplate::new("test")
            .axis("python", ["3.7", "3.8"])
            .secret("TOKEN", "token");
        let instances = MatrixExpander::expand(&template).instances;

        let first = p.bind(&instances[0], &template, &BTreeMap::new()).await.unwrap();
        let second = p.bind(&instances[1], &template, &BTreeMap::new()).await.unwrap();

        assert_eq!(first.get("TOKEN"), Some("rotated-0"));
        assert_eq!(second.get("TOKEN"), Some("rotated-1"));
    }

    #[test]
    fn test_mask_ignores_empty_secret() {
        let mut env = JobEnvironment::new();
        env.set_secret("EMPTY", SecretValue::new(""));
        env.set_secret("SHORT", SecretValue::new("abc"));
        env.set_secret("LONG", SecretValue::new("abcdef"));
        assert_eq!(env.mask("x abcdef y abc"), "x *** y ***");
    }
}
