// Run Context
// Per-run state: trigger metadata, run-wide environment, instance table and results

use crate::error::EngineResult;
use crate::execution::aggregator::ResultAggregator;
use crate::expression::{Condition, GateEvaluator};
use crate::model::{InstanceId, JobInstance, JobState};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Metadata describing what triggered the run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerInfo {
    pub branch: String,
    /// Event type, e.g. `push`, `pull_request`, `release`
    pub event: String,
    pub repository: String,
    pub repository_owner: String,
    pub actor: String,
}

impl TriggerInfo {
    /// Field names usable in gate conditions
    pub const FIELDS: &'static [&'static str] =
        &["branch", "event", "repository", "repository_owner", "actor"];

    pub fn new(branch: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            event: event.into(),
            ..Default::default()
        }
    }

    pub fn with_repository(mut self, owner: impl Into<String>, name: impl Into<String>) -> Self {
        self.repository_owner = owner.into();
        self.repository = name.into();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Look up a field by name; `None` for unknown fields
    pub fn field(&self, name: &str) -> Option<&str> {
        match name {
            "branch" => Some(&self.branch),
            "event" => Some(&self.event),
            "repository" => Some(&self.repository),
            "repository_owner" => Some(&self.repository_owner),
            "actor" => Some(&self.actor),
            _ => None,
        }
    }
}

/// State of one pipeline run
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub trigger: TriggerInfo,
    /// Run-wide environment visible to every job
    pub env: BTreeMap<String, String>,
    instances: Vec<JobInstance>,
    index: HashMap<InstanceId, usize>,
    results: ResultAggregator,
}

impl RunContext {
    pub fn new(trigger: TriggerInfo) -> Self {
        Self {
            trigger,
            ..Default::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn results(&self) -> &ResultAggregator {
        &self.results
    }

    /// All instances in expansion order
    pub fn instances(&self) -> &[JobInstance] {
        &self.instances
    }

    pub fn instance(&self, id: &InstanceId) -> Option<&JobInstance> {
        self.index.get(id).map(|&idx| &self.instances[idx])
    }

    pub(crate) fn instance_at(&self, idx: usize) -> &JobInstance {
        &self.instances[idx]
    }

    pub(crate) fn instance_at_mut(&mut self, idx: usize) -> &mut JobInstance {
        &mut self.instances[idx]
    }

    /// Append a template's expanded instances and register them with the aggregator.
    /// Returns the table indices of the new instances.
    pub(crate) fn add_instances(&mut self, template: &str, instances: Vec<JobInstance>) -> Vec<usize> {
        self.results
            .register(template, instances.iter().map(|i| i.id.clone()));

        let mut indices = Vec::with_capacity(instances.len());
        for instance in instances {
            let idx = self.instances.len();
            self.index.insert(instance.id.clone(), idx);
            self.instances.push(instance);
            indices.push(idx);
        }
        indices
    }

    /// Evaluate a gate condition against this run
    pub fn evaluate(&self, condition: &Condition) -> EngineResult<bool> {
        GateEvaluator::evaluate(condition, self)
    }

    /// Instance id and state for every instance, in expansion order
    pub fn state_table(&self) -> Vec<(InstanceId, JobState)> {
        self.instances
            .iter()
            .map(|i| (i.id.clone(), i.state))
            .collect()
    }

    pub(crate) fn into_instances(self) -> Vec<JobInstance> {
        self.instances
    }
}
