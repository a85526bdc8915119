// Job Instances
// One concrete run of a job template for one matrix point, plus its state machine

use crate::model::value::Value;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Identifier of a job instance: template name plus matrix point
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(template: &str, point: &MatrixPoint) -> Self {
        if point.is_empty() {
            Self(template.to_string())
        } else {
            Self(format!("{}[{}]", template, point))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Ordered axis assignments for one matrix combination
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatrixPoint(Vec<(String, Value)>);

impl MatrixPoint {
    pub fn new(values: Vec<(String, Value)>) -> Self {
        Self(values)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, axis: &str) -> Option<&Value> {
        self.0.iter().find(|(name, _)| name == axis).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl fmt::Display for MatrixPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", name, value)?;
        }
        Ok(())
    }
}

/// Lifecycle state of a job instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Blocked,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Whether moving to `next` respects the forward-only lifecycle
    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Blocked | Ready | Skipped)
                | (Blocked, Ready | Skipped)
                | (Ready, Running | Skipped)
                | (Running, Succeeded | Failed | Skipped)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Why an instance ended Skipped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "job", rename_all = "snake_case")]
pub enum SkipReason {
    /// The job's own gate evaluated false
    ConditionFalse,
    /// A dependency ended Failed
    DependencyFailed(String),
    /// A dependency was skipped and skips are not tolerated
    DependencySkipped(String),
    /// The run was cancelled
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConditionFalse => f.write_str("condition evaluated to false"),
            Self::DependencyFailed(job) => write!(f, "dependency '{}' failed", job),
            Self::DependencySkipped(job) => write!(f, "dependency '{}' was skipped", job),
            Self::Cancelled => f.write_str("run cancelled"),
        }
    }
}

/// A concrete, schedulable run of a job template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: InstanceId,
    /// Name of the template this instance was expanded from
    pub template: String,
    pub matrix: MatrixPoint,
    pub state: JobState,
    pub skip_reason: Option<SkipReason>,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub exit_status: Option<i32>,
    /// Runtime error that failed the instance
    pub error: Option<String>,
}

impl JobInstance {
    pub fn new(template: impl Into<String>, matrix: MatrixPoint) -> Self {
        let template = template.into();
        Self {
            id: InstanceId::new(&template, &matrix),
            template,
            matrix,
            state: JobState::Pending,
            skip_reason: None,
            started_at: None,
            finished_at: None,
            exit_status: None,
            error: None,
        }
    }

    /// Move to `next`, stamping timestamps. Returns false and leaves the
    /// instance untouched when the transition would regress.
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        if next == JobState::Running {
            self.started_at = Some(SystemTime::now());
        }
        if next.is_terminal() {
            self.finished_at = Some(SystemTime::now());
        }
        self.state = next;
        true
    }

    pub fn skip(&mut self, reason: SkipReason) -> bool {
        if !self.advance(JobState::Skipped) {
            return false;
        }
        self.skip_reason = Some(reason);
        true
    }
}
