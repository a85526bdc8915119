// Execution Events
// Progress reporting and event types for pipeline runs

use crate::execution::aggregator::JobOutcome;
use crate::execution::report::RunOutcome;
use crate::model::{InstanceId, SkipReason};

use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Adapt a progress receiver into a `Stream` of events
pub fn into_stream(rx: ProgressReceiver) -> UnboundedReceiverStream<ExecutionEvent> {
    UnboundedReceiverStream::new(rx)
}

/// Events emitted during a pipeline run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Run started with the expanded job set
    RunStarted {
        total_jobs: usize,
        total_instances: usize,
    },

    /// All dependencies of an instance are satisfied
    JobReady { instance: InstanceId },

    /// Instance dispatched to the step runner
    JobStarted {
        instance: InstanceId,
        template: String,
        total_steps: usize,
    },

    /// Instance finished with an outcome
    JobCompleted {
        instance: InstanceId,
        outcome: JobOutcome,
        exit_status: Option<i32>,
        duration: Duration,
    },

    /// Instance will not run
    JobSkipped {
        instance: InstanceId,
        reason: SkipReason,
    },

    /// Service passed its readiness check
    ServiceReady {
        instance: InstanceId,
        service: String,
    },

    /// Service was stopped and removed
    ServiceReleased {
        instance: InstanceId,
        service: String,
    },

    /// Step execution started
    StepStarted {
        instance: InstanceId,
        step_name: String,
        step_index: usize,
    },

    /// Step output (stdout/stderr), with secrets masked
    StepOutput {
        instance: InstanceId,
        step_index: usize,
        output: String,
        is_error: bool,
    },

    /// Step execution completed
    StepCompleted {
        instance: InstanceId,
        step_index: usize,
        exit_code: Option<i32>,
        duration: Duration,
    },

    /// Non-fatal problem (empty matrix axis, optional job failure)
    Warning {
        message: String,
        job: Option<String>,
    },

    /// Run finished
    RunCompleted {
        outcome: RunOutcome,
        duration: Duration,
    },
}

impl ExecutionEvent {
    pub fn job_started(instance: &InstanceId, template: impl Into<String>, total_steps: usize) -> Self {
        Self::JobStarted {
            instance: instance.clone(),
            template: template.into(),
            total_steps,
        }
    }

    pub fn job_completed(
        instance: &InstanceId,
        outcome: JobOutcome,
        exit_status: Option<i32>,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            instance: instance.clone(),
            outcome,
            exit_status,
            duration,
        }
    }

    pub fn job_skipped(instance: &InstanceId, reason: SkipReason) -> Self {
        Self::JobSkipped {
            instance: instance.clone(),
            reason,
        }
    }

    pub fn step_output(
        instance: &InstanceId,
        step_index: usize,
        output: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self::StepOutput {
            instance: instance.clone(),
            step_index,
            output: output.into(),
            is_error,
        }
    }

    pub fn warning(message: impl Into<String>, job: Option<String>) -> Self {
        Self::Warning {
            message: message.into(),
            job,
        }
    }

    /// Instance the event refers to, if any
    pub fn instance(&self) -> Option<&InstanceId> {
        match self {
            Self::JobReady { instance }
            | Self::JobStarted { instance, .. }
            | Self::JobCompleted { instance, .. }
            | Self::JobSkipped { instance, .. }
            | Self::ServiceReady { instance, .. }
            | Self::ServiceReleased { instance, .. }
            | Self::StepStarted { instance, .. }
            | Self::StepOutput { instance, .. }
            | Self::StepCompleted { instance, .. } => Some(instance),
            Self::RunStarted { .. } | Self::Warning { .. } | Self::RunCompleted { .. } => None,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();
        let id = InstanceId::from("lint");

        tx.send_event(ExecutionEvent::job_started(&id, "lint", 2));
        tx.send_event(ExecutionEvent::job_skipped(&id, SkipReason::ConditionFalse));

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ExecutionEvent::JobStarted { total_steps: 2, .. }));
        assert_eq!(first.instance(), Some(&id));

        let second = rx.recv().await.unwrap();
        assert!(matches!(
            second,
            ExecutionEvent::JobSkipped {
                reason: SkipReason::ConditionFalse,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_event_stream() {
        let (tx, rx) = progress_channel();
        tx.send_event(ExecutionEvent::warning("axis empty", Some("test".into())));
        tx.send_event(ExecutionEvent::RunCompleted {
            outcome: RunOutcome::Succeeded,
            duration: Duration::from_millis(5),
        });
        drop(tx);

        let events: Vec<_> = into_stream(rx).collect().await;
        assert_eq!(events.len(), 2);
        assert!(events[0].instance().is_none());
        assert!(matches!(
            events[1],
            ExecutionEvent::RunCompleted {
                outcome: RunOutcome::Succeeded,
                ..
            }
        ));
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::warning("test", None));
    }
}
