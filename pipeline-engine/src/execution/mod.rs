// Execution Engine Module
// Job graph, matrix expansion, scheduling and result aggregation

pub mod aggregator;
pub mod context;
pub mod events;
pub mod graph;
pub mod matrix;
pub mod report;
pub mod scheduler;

// Re-export key types
pub use aggregator::{JobOutcome, JobResult, ResultAggregator};
pub use context::{RunContext, TriggerInfo};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use graph::JobGraph;
pub use matrix::{Expansion, MatrixExpander};
pub use report::{RunOutcome, RunReport};
pub use scheduler::Scheduler;
