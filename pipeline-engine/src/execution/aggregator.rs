// Result Aggregator
// Single source of truth for job outcomes, read by dependency resolution and gates

use crate::error::{EngineError, EngineResult};
use crate::model::{InstanceId, JobInstance, JobState};
use crate::runners::ArtifactRef;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

/// Terminal outcome of a job instance, or of a whole template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl JobOutcome {
    pub fn from_state(state: JobState) -> Option<Self> {
        match state {
            JobState::Succeeded => Some(Self::Succeeded),
            JobState::Failed => Some(Self::Failed),
            JobState::Skipped => Some(Self::Skipped),
            _ => None,
        }
    }
}

/// Recorded result of one job instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub instance: InstanceId,
    pub template: String,
    pub outcome: JobOutcome,
    pub exit_status: Option<i32>,
    pub artifacts: Vec<ArtifactRef>,
    /// Structured output reported by the step runner
    pub output: Option<serde_json::Value>,
    pub recorded_at: SystemTime,
}

impl JobResult {
    pub fn new(instance: &JobInstance, outcome: JobOutcome) -> Self {
        Self {
            instance: instance.id.clone(),
            template: instance.template.clone(),
            outcome,
            exit_status: instance.exit_status,
            artifacts: Vec::new(),
            output: None,
            recorded_at: SystemTime::now(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<ArtifactRef>) -> Self {
        self.artifacts = artifacts;
        self
    }

    pub fn with_output(mut self, output: Option<serde_json::Value>) -> Self {
        self.output = output;
        self
    }
}

#[derive(Debug, Default)]
struct AggregatorState {
    /// Template name -> instances expected to report
    expected: HashMap<String, Vec<InstanceId>>,
    results: HashMap<InstanceId, JobResult>,
    /// Instance ids in recording order
    order: Vec<InstanceId>,
}

/// Thread-safe store of job results. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    inner: Arc<Mutex<AggregatorState>>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AggregatorState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Declare the instances a template expanded into (possibly none)
    pub fn register(&self, template: &str, instances: impl IntoIterator<Item = InstanceId>) {
        self.lock()
            .expected
            .insert(template.to_string(), instances.into_iter().collect());
    }

    /// Record the outcome of an instance. At most one result is accepted per instance.
    pub fn record(&self, result: JobResult) -> EngineResult<()> {
        let mut state = self.lock();
        if state.results.contains_key(&result.instance) {
            return Err(EngineError::DuplicateResult(result.instance.to_string()));
        }
        state.order.push(result.instance.clone());
        state.results.insert(result.instance.clone(), result);
        Ok(())
    }

    /// Aggregate outcome of a template.
    ///
    /// `Failed` as soon as any instance failed; otherwise `None` until every
    /// instance has reported, then `Skipped` if any instance was skipped and
    /// `Succeeded` if all succeeded. A template that expanded into no
    /// instances reports `Skipped`.
    pub fn query(&self, job_name: &str) -> Option<JobOutcome> {
        let state = self.lock();
        let expected = state.expected.get(job_name)?;

        let outcomes: Vec<Option<JobOutcome>> = expected
            .iter()
            .map(|id| state.results.get(id).map(|r| r.outcome))
            .collect();

        if outcomes.contains(&Some(JobOutcome::Failed)) {
            return Some(JobOutcome::Failed);
        }
        if outcomes.contains(&None) {
            return None;
        }
        if outcomes.contains(&Some(JobOutcome::Skipped)) || outcomes.is_empty() {
            return Some(JobOutcome::Skipped);
        }
        Some(JobOutcome::Succeeded)
    }

    pub fn query_instance(&self, id: &InstanceId) -> Option<JobResult> {
        self.lock().results.get(id).cloned()
    }

    /// Whether a template was registered with this aggregator
    pub fn knows(&self, job_name: &str) -> bool {
        self.lock().expected.contains_key(job_name)
    }

    /// All recorded results in recording order
    pub fn snapshot(&self) -> Vec<JobResult> {
        let state = self.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.results.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MatrixPoint, Value};

    fn instance(template: &str, py: Option<&str>, state: JobState) -> JobInstance {
        let point = match py {
            Some(v) => MatrixPoint::new(vec![("python".to_string(), Value::from(v))]),
            None => MatrixPoint::default(),
        };
        let mut job = JobInstance::new(template, point);
        job.state = state;
        job
    }

    fn result(job: &JobInstance) -> JobResult {
        let outcome = JobOutcome::from_state(job.state).unwrap();
        JobResult::new(job, outcome)
    }

    #[test]
    fn test_record_and_query() {
        let agg = ResultAggregator::new();
        let lint = instance("lint", None, JobState::Succeeded);
        agg.register("lint", [lint.id.clone()]);

        assert_eq!(agg.query("lint"), None);
        agg.record(result(&lint)).unwrap();
        assert_eq!(agg.query("lint"), Some(JobOutcome::Succeeded));
        assert_eq!(agg.query("unknown"), None);
        assert!(agg.knows("lint"));
        assert!(!agg.knows("unknown"));
    }

    #[test]
    fn test_duplicate_record_rejected() {
        let agg = ResultAggregator::new();
        let lint = instance("lint", None, JobState::Succeeded);
        agg.register("lint", [lint.id.clone()]);
        agg.record(result(&lint)).unwrap();

        let mut again = lint.clone();
        again.state = JobState::Failed;
        let err = agg.record(result(&again)).unwrap_err();

        assert!(matches!(err, EngineError::DuplicateResult(ref id) if id == "lint"));
        assert_eq!(agg.len(), 1);
        assert_eq!(agg.query("lint"), Some(JobOutcome::Succeeded));
        assert_eq!(
            agg.query_instance(&lint.id).map(|r| r.outcome),
            Some(JobOutcome::Succeeded)
        );
    }

    #[test]
    fn test_matrix_aggregate() {
        let agg = ResultAggregator::new();
        let jobs: Vec<_> = ["3.6", "3.7", "3.8"]
            .iter()
            .map(|v| instance("test", Some(v), JobState::Succeeded))
            .collect();
        agg.register("test", jobs.iter().map(|j| j.id.clone()));

        agg.record(result(&jobs[0])).unwrap();
        agg.record(result(&jobs[1])).unwrap();
        assert_eq!(agg.query("test"), None);
        agg.record(result(&jobs[2])).unwrap();
        assert_eq!(agg.query("test"), Some(JobOutcome::Succeeded));
    }

    #[test]
    fn test_failure_reported_early() {
        let agg = ResultAggregator::new();
        let ok = instance("test", Some("3.6"), JobState::Succeeded);
        let bad = instance("test", Some("3.7"), JobState::Failed);
        let pending = instance("test", Some("3.8"), JobState::Running);
        agg.register("test", [ok.id.clone(), bad.id.clone(), pending.id.clone()]);

        agg.record(result(&bad)).unwrap();
        assert_eq!(agg.query("test"), Some(JobOutcome::Failed));
    }

    #[test]
    fn test_empty_template_is_skipped() {
        let agg = ResultAggregator::new();
        agg.register("empty", Vec::new());
        assert_eq!(agg.query("empty"), Some(JobOutcome::Skipped));
    }

    #[test]
    fn test_snapshot_order() {
        let agg = ResultAggregator::new();
        let a = instance("a", None, JobState::Succeeded);
        let b = instance("b", None, JobState::Skipped);
        agg.register("a", [a.id.clone()]);
        agg.register("b", [b.id.clone()]);

        agg.record(result(&b)).unwrap();
        agg.record(result(&a)).unwrap();

        let ids: Vec<_> = agg.snapshot().into_iter().map(|r| r.instance).collect();
        assert_eq!(ids, vec![b.id, a.id]);
    }

    #[tokio::test]
    async fn test_concurrent_records_are_serialized() {
        let agg = ResultAggregator::new();
        let jobs: Vec<_> = (0..32)
            .map(|i| instance("test", Some(&i.to_string()), JobState::Succeeded))
            .collect();
        agg.register("test", jobs.iter().map(|j| j.id.clone()));

        let mut handles = Vec::new();
        for job in jobs.clone() {
            let agg = agg.clone();
            handles.push(tokio::spawn(async move { agg.record(result(&job)) }));
        }
        for job in jobs {
            let agg = agg.clone();
            handles.push(tokio::spawn(async move { agg.record(result(&job)) }));
        }

        let mut ok = 0;
        let mut dup = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => ok += 1,
                Err(EngineError::DuplicateResult(_)) => dup += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
        assert_eq!(ok, 32);
        assert_eq!(dup, 32);
        assert_eq!(agg.query("test"), Some(JobOutcome::Succeeded));
    }
}
