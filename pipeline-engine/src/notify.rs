// Notifications
// Consumers of the final run report, such as merge and release gates

use crate::execution::report::RunReport;

use std::sync::Arc;
use tracing::{info, warn};

/// Receives the report of every finished run
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, report: &RunReport);
}

/// Logs a summary of the report
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

#[async_trait::async_trait]
impl NotificationSink for TracingSink {
    async fn notify(&self, report: &RunReport) {
        let (succeeded, failed, skipped) = report.counts();
        info!(
            outcome = %report.outcome,
            succeeded,
            failed,
            skipped,
            duration = ?report.duration,
            "pipeline run finished"
        );
        for instance in report.instances.iter().filter(|i| i.error.is_some()) {
            warn!(
                instance = %instance.id,
                error = instance.error.as_deref().unwrap_or_default(),
                "job failed"
            );
        }
    }
}

/// Forwards the report only when all the named jobs succeeded.
/// Used for merge and release consumers.
pub struct GatedSink {
    required: Vec<String>,
    inner: Arc<dyn NotificationSink>,
}

impl GatedSink {
    pub fn new<I, S>(required: I, inner: Arc<dyn NotificationSink>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            inner,
        }
    }

    pub fn is_open(&self, report: &RunReport) -> bool {
        let jobs: Vec<&str> = self.required.iter().map(String::as_str).collect();
        report.all_succeeded(&jobs)
    }
}

#[async_trait::async_trait]
impl NotificationSink for GatedSink {
    async fn notify(&self, report: &RunReport) {
        if self.is_open(report) {
            self.inner.notify(report).await;
        } else {
            info!(required = ?self.required, "gate closed, notification withheld");
        }
    }
}
