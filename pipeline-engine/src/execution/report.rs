// Run Report
// Final outcome of a pipeline run with the full per-instance state table

use crate::execution::aggregator::{JobOutcome, JobResult};
use crate::model::{InstanceId, JobInstance, JobState};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed => f.write_str("failed"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Archived state of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Every instance in expansion order, in its terminal state
    pub instances: Vec<JobInstance>,
    /// Recorded results in completion order
    pub results: Vec<JobResult>,
    pub warnings: Vec<String>,
    pub duration: Duration,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    /// Whether every instance of every named job succeeded. A job that
    /// produced no instances does not count as succeeded.
    pub fn all_succeeded(&self, jobs: &[&str]) -> bool {
        jobs.iter().all(|job| {
            let mut instances = self.instances.iter().filter(|i| i.template == *job).peekable();
            instances.peek().is_some() && instances.all(|i| i.state == JobState::Succeeded)
        })
    }

    pub fn instance(&self, id: &InstanceId) -> Option<&JobInstance> {
        self.instances.iter().find(|i| &i.id == id)
    }

    /// Instances of one job template
    pub fn instances_of<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a JobInstance> + 'a {
        self.instances.iter().filter(move |i| i.template == job)
    }

    pub fn result(&self, id: &InstanceId) -> Option<&JobResult> {
        self.results.iter().find(|r| &r.instance == id)
    }

    /// Number of instances per outcome: (succeeded, failed, skipped)
    pub fn counts(&self) -> (usize, usize, usize) {
        self.results.iter().fold((0, 0, 0), |(s, f, k), r| match r.outcome {
            JobOutcome::Succeeded => (s + 1, f, k),
            JobOutcome::Failed => (s, f + 1, k),
            JobOutcome::Skipped => (s, f, k + 1),
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
