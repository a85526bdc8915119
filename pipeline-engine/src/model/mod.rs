// Pipeline Data Model
// Job templates, concrete job instances, service specs and matrix values

pub mod instance;
pub mod job;
pub mod service;
pub mod value;

pub use instance::{InstanceId, JobInstance, JobState, MatrixPoint, SkipReason};
pub use job::{JobTemplate, MatrixAxis, Shell, Step};
pub use service::{PortMapping, ReadinessCheck, ServiceSpec};
pub use value::Value;
