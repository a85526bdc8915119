// Job Templates
// Immutable job definitions supplied by the pipeline definition loader

use crate::expression::Condition;
use crate::model::service::ServiceSpec;
use crate::model::value::Value;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A named job with ordered steps, dependencies and an optional matrix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobTemplate {
    /// Unique job name
    pub name: String,

    /// Steps executed in order
    #[serde(default)]
    pub steps: Vec<Step>,

    /// Names of jobs that must finish before this one
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Matrix axes in declaration order (first axis varies slowest)
    #[serde(default)]
    pub matrix: Vec<MatrixAxis>,

    /// Matrix points removed after expansion
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, Value>>,

    /// Gate deciding whether the job runs
    #[serde(default)]
    pub condition: Condition,

    /// Cap on simultaneously running instances of this template
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Auxiliary services started for each instance
    #[serde(default)]
    pub services: Vec<ServiceSpec>,

    /// Plain environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Environment variable name -> secret store name
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,

    /// Whether a failure of this job fails the run
    #[serde(default = "default_required")]
    pub required: bool,

    /// Run even when a dependency was skipped
    #[serde(default)]
    pub tolerate_skipped: bool,

    /// Wall-clock limit for one instance, in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_required() -> bool {
    true
}

/// One matrix dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<Value>,
}

/// Shell used to execute a script step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    /// sh on Unix, cmd on Windows
    #[default]
    Default,
    Bash,
    Pwsh,
    PowerShell,
}

/// A single executable action of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub name: String,
    /// Script body
    pub run: String,
    #[serde(default)]
    pub shell: Shell,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// A failing step does not fail the job
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Paths (relative to the working directory) reported as artifacts on success
    #[serde(default)]
    pub artifacts: Vec<String>,
}

impl Step {
    pub fn script(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: run.into(),
            shell: Shell::Default,
            working_dir: None,
            env: BTreeMap::new(),
            continue_on_error: false,
            timeout_secs: None,
            artifacts: Vec::new(),
        }
    }

    pub fn with_shell(mut self, shell: Shell) -> Self {
        self.shell = shell;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn artifact(mut self, path: impl Into<String>) -> Self {
        self.artifacts.push(path.into());
        self
    }
}

impl JobTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            depends_on: Vec::new(),
            matrix: Vec::new(),
            exclude: Vec::new(),
            condition: Condition::Always,
            max_parallel: None,
            services: Vec::new(),
            env: BTreeMap::new(),
            secrets: BTreeMap::new(),
            required: true,
            tolerate_skipped: false,
            timeout_secs: None,
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn depends_on<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn axis<I, V>(mut self, name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.matrix.push(MatrixAxis {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn exclude<I, K, V>(mut self, point: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.exclude
            .push(point.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn condition(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = Some(max);
        self
    }

    pub fn service(mut self, service: ServiceSpec) -> Self {
        self.services.push(service);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn secret(mut self, env_var: impl Into<String>, secret_name: impl Into<String>) -> Self {
        self.secrets.insert(env_var.into(), secret_name.into());
        self
    }

    /// Mark the job as optional: its failure does not fail the run
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn tolerate_skipped(mut self) -> Self {
        self.tolerate_skipped = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn has_matrix(&self) -> bool {
        !self.matrix.is_empty()
    }

    /// Effective per-template concurrency cap
    pub fn parallel_limit(&self) -> Option<usize> {
        self.max_parallel.map(|m| m.max(1))
    }
}
