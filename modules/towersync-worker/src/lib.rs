pub mod coordinator;
pub mod listener;
pub mod metrics;
pub mod task;
pub mod web;

pub use coordinator::{run_job, JobDescriptor};
pub use metrics::Metrics;
pub use task::{MessageHeaders, TaskOutput, TaskUpdater};
